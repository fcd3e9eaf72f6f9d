use std::io;
use thiserror::Error;

/// Errors surfaced by the emulator core.
///
/// Device state machines never propagate these to the guest; they translate
/// them into unit-check status plus sense bits.  Configuration errors abort
/// startup with the offending line number.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config line {line}: {reason}")]
    Config { line: usize, reason: String },

    #[error("{0}: no such device model")]
    UnknownModel(String),

    #[error("device {0:03x}: already configured")]
    DuplicateDevice(u16),

    #[error("{0}: invalid device address")]
    BadAddress(String),

    #[error("{0}: file already attached")]
    AlreadyAttached(String),

    #[error("no file attached")]
    NotAttached,

    #[error("operation not supported by this device")]
    Unsupported,

    #[error("tape format error: {0}")]
    TapeFormat(String),

    #[error("end of media")]
    EndOfMedia,

    #[error("card format error: {0}")]
    CardFormat(String),

    #[error("telnet: {0}")]
    Telnet(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn config(line: usize, reason: impl Into<String>) -> Error {
        Error::Config { line, reason: reason.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
