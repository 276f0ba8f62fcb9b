//! Link errors

use thiserror::Error;

/// Errors that can occur while driving a serial link
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Cannot open port {port}: {reason}")]
    Open { port: String, reason: String },

    #[error("Device disconnected: {0}")]
    Resource(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("Write timed out")]
    WriteTimeout,

    #[error("Write of {len} bytes exceeds the {limit} byte write buffer")]
    WriteTooLarge { len: usize, limit: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unsupported setting: {0}")]
    UnsupportedSetting(String),

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("Session is no longer running")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        LinkError::Serial(e.to_string())
    }
}
