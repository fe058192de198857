use serde::Serialize;
use thiserror::Error;

/// A single `+CMGL` segment that could not be turned into an [`SmsRecord`].
///
/// Listing parsers collect these next to the successfully parsed records so one
/// malformed entry never hides the rest of the modem's storage.
///
/// [`SmsRecord`]: crate::modem::SmsRecord
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("segment {segment}: {reason}")]
pub struct ParseError {
    /// Zero-based ordinal of the segment in the listing.
    pub segment: usize,
    /// The segment text as received, without the `+CMGL:` marker.
    pub raw: String,
    pub reason: String,
}

/// Errors raised by the transport, the command engine and the SMS codec.
#[derive(Debug, Error)]
pub enum AtError {
    /// The serial device could not be opened or initialized.
    #[error("failed to open {path}: {reason}")]
    Open { path: String, reason: String },

    /// No terminator arrived before the deadline. Carries whatever was read.
    #[error("timed out waiting for modem reply (read so far: {partial:?})")]
    Timeout { partial: String },

    /// `AT+CMGS` finished with something other than `OK`.
    #[error("send failed: {0:?}")]
    SendFailed(String),

    /// `AT+CMGD` finished with something other than `OK`.
    #[error("delete failed: {0:?}")]
    DeleteFailed(String),

    /// `AT+CMGR` returned `ERROR` or an unreadable record.
    #[error("read failed: {0:?}")]
    ReadFailed(String),

    /// A command that must succeed (init sequence) was rejected.
    #[error("command {command:?} rejected: {response:?}")]
    CommandFailed { command: String, response: String },

    /// Caller input that cannot be framed as an AT command (quotes, Ctrl-Z, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// An operation was attempted while no modem session is open.
    #[error("device not ready")]
    DeviceNotReady,

    /// Transport failure. On the command port this ends the session.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AtError {
    /// True when the error means the link itself is gone rather than the modem
    /// having answered badly.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, AtError::Io(_))
    }
}

pub type AtResult<T> = std::result::Result<T, AtError>;
