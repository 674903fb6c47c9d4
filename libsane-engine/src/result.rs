use crate::sense::Outcome;
use thiserror::Error;

pub type Result<T> = ::core::result::Result<T, SaneError>;

/// Generic status vocabulary every dialect reports through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SaneError {
    #[error("unsupported")]
    Unsupported,

    #[error("cancelled")]
    Cancelled,

    #[error("device busy")]
    DeviceBusy,

    #[error("invalid value")]
    Inval,

    #[error("end of file")]
    EOF,

    #[error("document feeder is jammed")]
    Jammed,

    #[error("document feeder is out of documents")]
    NoDocs,

    #[error("cover open")]
    CoverOpen,

    #[error("error occurred while communicating with the device")]
    IO,

    #[error("not enough memory")]
    NoMem,

    #[error("access denied")]
    AccessDenied,
}

impl SaneError {
    /// Errors after which the current scan cannot continue and must be aborted.
    pub fn is_fatal_to_scan(self) -> bool {
        matches!(self, SaneError::Jammed | SaneError::CoverOpen)
    }
}

/// Turn a classified sense outcome into a status.
pub fn from_outcome(outcome: Outcome) -> Result<()> {
    match outcome {
        Outcome::Ready => Ok(()),
        Outcome::Busy => Err(SaneError::DeviceBusy),
        Outcome::NoMedium => Err(SaneError::NoDocs),
        Outcome::Jammed => Err(SaneError::Jammed),
        Outcome::CoverOpen => Err(SaneError::CoverOpen),
        Outcome::IoError => Err(SaneError::IO),
        Outcome::Unsupported => Err(SaneError::Unsupported),
        Outcome::Cancelled => Err(SaneError::Cancelled),
        Outcome::InvalidParameter => Err(SaneError::Inval),
        Outcome::OutOfMemory => Err(SaneError::NoMem),
        Outcome::EndOfData => Err(SaneError::EOF),
    }
}
