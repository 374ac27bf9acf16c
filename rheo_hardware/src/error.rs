use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("sensor timeout")]
    Timeout,
    #[error("drive is de-energized")]
    DriveDeenergized,
    #[error("drive is in safe start")]
    SafeStart,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
