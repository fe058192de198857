//! # GSM Modem Protocol Module
//!
//! Everything needed to talk to a GSM modem in SMS text mode:
//!
//! - [`transport`]: the serial link and the [`DeviceOpener`] seam
//! - [`engine`]: the AT [`CommandEngine`] (`send`, `expect`, `read_until`, `send_command`)
//! - [`sms`]: compose/list/read/delete SMS on top of the engine
//! - [`notify`]: classification of unsolicited lines from the notification port
//! - [`mock`]: a scripted transport for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use smsgate::modem::{self, CommandEngine, EngineTiming, SerialTransport};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let port = SerialTransport::open("/dev/ttyUSB0", 115200, Duration::from_secs(1))?;
//!     let mut engine = CommandEngine::new(port, EngineTiming::default());
//!     engine.execute("AT+CMGF=1\r\n").await?;
//!     modem::sms::send_sms(&mut engine, "+15551234567", "hello").await?;
//!     Ok(())
//! }
//! ```

pub mod engine;
pub mod error;
pub mod mock;
pub mod notify;
pub mod sms;
pub mod transport;

pub use engine::{CommandEngine, EngineTiming, Expected};
pub use error::{AtError, AtResult, ParseError};
pub use notify::Notification;
pub use sms::{LinkStats, ListingReport, SmsRecord};
pub use transport::{DeviceOpener, SerialOpener, SerialTransport, Transport};

/// Final line of a successful command.
pub const OK_TERMINATOR: &str = "OK\r\n";

/// Final line of a rejected command.
pub const ERROR_TERMINATOR: &str = "ERROR\r\n";

/// Starts of the numeric final error lines (`+CME ERROR: <n>`, `+CMS ERROR: <n>`).
pub const EXTENDED_ERROR_PREFIXES: [&str; 2] = ["+CME ERROR:", "+CMS ERROR:"];

/// Data-entry prompt after `AT+CMGS`.
pub const PROMPT: &str = "> ";

/// Ends SMS body entry in text mode.
pub const CTRL_Z: char = '\u{1a}';

/// Bytes the modem adds around a reply line (`\r\n`).
pub const LINE_ENDING_OVERHEAD: usize = 2;

/// The engine type used for real sessions.
pub type DynEngine = CommandEngine<Box<dyn Transport>>;

/// Whether one reply line (line ending optional) is an extended error result.
pub fn is_extended_error(line: &str) -> bool {
    let line = line.trim();
    EXTENDED_ERROR_PREFIXES.iter().any(|p| line.starts_with(p))
}

/// Whether `text` ends with a final error result, plain or extended.
pub fn ends_in_error(text: &str) -> bool {
    if text.ends_with(ERROR_TERMINATOR) {
        return true;
    }
    let Some(body) = text.strip_suffix("\r\n") else {
        return false;
    };
    body.rsplit('\n').next().is_some_and(is_extended_error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_errors_count_as_final_errors() {
        assert!(ends_in_error("\r\nERROR\r\n"));
        assert!(ends_in_error("\r\n+CME ERROR: 321\r\n"));
        assert!(ends_in_error("+CMGR: ...\r\n+CMS ERROR: 321\r\n"));
        assert!(!ends_in_error("\r\n+CME ERROR: 321"));
        assert!(!ends_in_error("\r\nOK\r\n"));
        assert!(!is_extended_error("hello +CME ERROR: 1"));
    }
}
