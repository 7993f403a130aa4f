use thiserror::Error;

/// Crate-wide error type, shared by every manager component that surfaces
/// errors to a synchronous caller (§7).
#[derive(Error, Debug)]
pub enum Error {
  #[error("configuration: {0}")]
  Configuration(String),

  #[error("not found: {entity} {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("parse: {0}")]
  Parse(String),

  #[error("protocol: {0}")]
  Protocol(String),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("json: {0}")]
  Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
