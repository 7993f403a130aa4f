//! Converter/filter identifiers (§3).

use crate::error::{Error, Result};

pub const RESERVED_CONVERTER_NAME: &str = "none";

/// Validates a converter/filter name: alphanumeric-underscore, and the
/// reserved name `none` is forbidden (§3, §4.8).
pub fn validate_converter_name(name: &str) -> Result<()> {
  if name == RESERVED_CONVERTER_NAME {
    return Err(Error::Configuration(format!("converter name {RESERVED_CONVERTER_NAME:?} is reserved")));
  }
  if name.is_empty() {
    return Err(Error::Configuration("converter name must not be empty".into()));
  }
  if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
    return Err(Error::Configuration(format!(
      "converter name {name:?} must be alphanumeric-underscore only"
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_reserved_name() {
    assert!(validate_converter_name("none").is_err());
  }

  #[test]
  fn rejects_bad_charset() {
    assert!(validate_converter_name("my-converter").is_err());
    assert!(validate_converter_name("my converter").is_err());
  }

  #[test]
  fn accepts_valid_names() {
    assert!(validate_converter_name("http_decoder").is_ok());
    assert!(validate_converter_name("HTTP2").is_ok());
  }
}
