use thiserror::Error;

/// Manager-wide error type (§7).
#[derive(Error, Debug)]
pub enum ManagerError {
  #[error(transparent)]
  Core(#[from] streamcore::Error),

  #[error("configuration: {0}")]
  Configuration(String),

  #[error("not found: {entity} {id}")]
  NotFound { entity: &'static str, id: String },

  #[error("{0} too complex for converter attachment")]
  TooComplex(String),

  #[error("cycle detected introducing reference to {0}")]
  Cycle(String),

  #[error("protocol: {0}")]
  Protocol(String),

  #[error("io: {0}")]
  Io(#[from] std::io::Error),

  #[error("the scheduler has shut down")]
  SchedulerGone,
}

pub type Result<T> = std::result::Result<T, ManagerError>;

impl From<tokio::sync::oneshot::error::RecvError> for ManagerError {
  fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
    ManagerError::SchedulerGone
  }
}
