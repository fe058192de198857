//! AT command engine: framed writes and deadline-bounded reply matching.
//!
//! All reads are driven by a `tokio::time::interval` at `poll_interval`
//! granularity and bounded by an overall deadline, so a silent modem costs at
//! most one deadline per exchange.

use log::{debug, trace, warn};
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::error::{AtError, AtResult};
use super::transport::Transport;
use super::{is_extended_error, ERROR_TERMINATOR, LINE_ENDING_OVERHEAD, OK_TERMINATOR};
use crate::logutil::escape_log;
use crate::metrics;

/// Longest line checked for an extended error result; the rest of a longer
/// line is ignored.
const MAX_RESULT_LINE: usize = 64;

/// Poll granularity and deadlines of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTiming {
    pub poll_interval: Duration,
    /// Ceiling for `expect` and single-byte reads.
    pub expect_timeout: Duration,
    /// Ceiling for `read_until`.
    pub read_until_timeout: Duration,
}

impl Default for EngineTiming {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            expect_timeout: Duration::from_secs(2),
            read_until_timeout: Duration::from_secs(2),
        }
    }
}

/// A successful `expect`: the buffered tail and the terminator it ended with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expected {
    pub text: String,
    pub terminator: String,
}

impl Expected {
    pub fn is(&self, terminator: &str) -> bool {
        self.terminator == terminator
    }
}

/// Drives one modem command port. Not `Sync`-shared: callers wrap it in a lock
/// so only one exchange is in flight.
pub struct CommandEngine<T> {
    transport: T,
    timing: EngineTiming,
}

impl<T: Transport> CommandEngine<T> {
    pub fn new(transport: T, timing: EngineTiming) -> Self {
        Self { transport, timing }
    }

    pub fn timing(&self) -> EngineTiming {
        self.timing
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    fn ticker(&self) -> tokio::time::Interval {
        let mut ticker = interval(self.timing.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    /// Discard unread input, then write `command` verbatim. The caller supplies
    /// line terminators.
    pub fn send(&mut self, command: &str) -> AtResult<()> {
        self.send_bytes(command.as_bytes())
    }

    pub fn send_bytes(&mut self, data: &[u8]) -> AtResult<()> {
        debug!("AT> {}", escape_log(&String::from_utf8_lossy(data)));
        self.transport.discard_input()?;
        self.transport.write_all(data)?;
        metrics::inc_commands_sent();
        Ok(())
    }

    /// Wait until the received tail ends with one of `terminators`.
    ///
    /// Only the last `longest terminator + 2` bytes are kept; that is enough to
    /// match a suffix while ignoring whatever preceded it.
    ///
    /// A complete `+CME ERROR:`/`+CMS ERROR:` line also ends the wait. It comes
    /// back with the [`ERROR_TERMINATOR`] terminator and the whole line as text.
    pub async fn expect(&mut self, terminators: &[&str]) -> AtResult<Expected> {
        let capacity = terminators.iter().map(|t| t.len()).max().unwrap_or(0) + LINE_ENDING_OVERHEAD;
        let mut tail: Vec<u8> = Vec::with_capacity(capacity * 2);
        let mut line: Vec<u8> = Vec::with_capacity(MAX_RESULT_LINE);
        let mut chunk = [0u8; 256];
        let deadline = Instant::now() + self.timing.expect_timeout;
        let mut ticker = self.ticker();

        loop {
            ticker.tick().await;
            loop {
                let n = self.transport.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                for &b in &chunk[..n] {
                    if b == b'\n' {
                        if is_extended_error(&String::from_utf8_lossy(&line)) {
                            let text = format!("{}\n", String::from_utf8_lossy(&line));
                            debug!("AT< {}", escape_log(&text));
                            return Ok(Expected {
                                text,
                                terminator: ERROR_TERMINATOR.to_string(),
                            });
                        }
                        line.clear();
                    } else if line.len() < MAX_RESULT_LINE {
                        line.push(b);
                    }
                }
                tail.extend_from_slice(&chunk[..n]);
                if tail.len() > capacity {
                    let excess = tail.len() - capacity;
                    tail.drain(..excess);
                }
                if let Some(term) = terminators.iter().find(|t| tail.ends_with(t.as_bytes())) {
                    let text = String::from_utf8_lossy(&tail).into_owned();
                    debug!("AT< {}", escape_log(&text));
                    return Ok(Expected {
                        text,
                        terminator: term.to_string(),
                    });
                }
            }
            if Instant::now() >= deadline {
                let partial = String::from_utf8_lossy(&tail).into_owned();
                warn!(
                    "Timed out expecting {:?}; read so far: {}",
                    terminators,
                    escape_log(&partial)
                );
                metrics::inc_timeouts();
                return Err(AtError::Timeout { partial });
            }
        }
    }

    /// Accumulate bytes one at a time until the text ends with `terminator`.
    /// The terminator is stripped from the result.
    pub async fn read_until(&mut self, terminator: &str) -> AtResult<String> {
        let mut acc: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        let deadline = Instant::now() + self.timing.read_until_timeout;
        let mut ticker = self.ticker();

        loop {
            ticker.tick().await;
            while self.transport.read(&mut byte)? == 1 {
                acc.push(byte[0]);
                if acc.ends_with(terminator.as_bytes()) {
                    acc.truncate(acc.len() - terminator.len());
                    let text = String::from_utf8_lossy(&acc).into_owned();
                    trace!("AT< {}", escape_log(&text));
                    return Ok(text);
                }
            }
            if Instant::now() >= deadline {
                let partial = String::from_utf8_lossy(&acc).into_owned();
                warn!(
                    "Timed out reading until {}; read so far: {}",
                    escape_log(terminator),
                    escape_log(&partial)
                );
                metrics::inc_timeouts();
                return Err(AtError::Timeout { partial });
            }
        }
    }

    /// Wait for a single byte. Returns an empty string when none arrives before
    /// the deadline.
    pub async fn read_one(&mut self) -> AtResult<String> {
        let mut byte = [0u8; 1];
        let deadline = Instant::now() + self.timing.expect_timeout;
        let mut ticker = self.ticker();
        loop {
            ticker.tick().await;
            if self.transport.read(&mut byte)? == 1 {
                return Ok(String::from_utf8_lossy(&byte).into_owned());
            }
            if Instant::now() >= deadline {
                return Ok(String::new());
            }
        }
    }

    /// `send` followed by either an `OK`/`ERROR` wait or a single-byte read.
    ///
    /// The raw reply is returned as-is: an `ERROR` reply is not an `Err`, the
    /// caller decides what it means.
    pub async fn send_command(&mut self, command: &str, wait_for_ok: bool) -> AtResult<String> {
        self.send(command)?;
        if wait_for_ok {
            let reply = self.expect(&[OK_TERMINATOR, ERROR_TERMINATOR]).await?;
            Ok(reply.text)
        } else {
            self.read_one().await
        }
    }

    /// Like `send_command(command, true)` but anything other than `OK` is an
    /// error.
    pub async fn execute(&mut self, command: &str) -> AtResult<String> {
        self.send(command)?;
        let reply = self.expect(&[OK_TERMINATOR, ERROR_TERMINATOR]).await?;
        if reply.is(OK_TERMINATOR) {
            Ok(reply.text)
        } else {
            Err(AtError::CommandFailed {
                command: command.trim_end().to_string(),
                response: reply.text,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::mock::MockTransport;

    fn engine(mock: &MockTransport) -> CommandEngine<MockTransport> {
        CommandEngine::new(mock.clone(), EngineTiming::default())
    }

    #[tokio::test(start_paused = true)]
    async fn send_discards_stale_input_before_writing() {
        let mock = MockTransport::new();
        mock.push_inbound("stale garbage");
        let mut eng = engine(&mock);
        eng.send("AT\r\n").unwrap();
        assert_eq!(mock.discard_count(), 1);
        assert_eq!(mock.pending_inbound(), 0);
        assert_eq!(mock.written(), vec!["AT\r\n".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn read_until_strips_terminator_across_chunks() {
        let mock = MockTransport::new();
        mock.set_max_chunk(Some(3));
        mock.push_inbound("\r\n+CSQ: 17,99\r\n\r\nOK\r\n");
        let mut eng = engine(&mock);
        let text = eng.read_until("OK\r\n").await.unwrap();
        assert_eq!(text, "\r\n+CSQ: 17,99\r\n\r\n");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_turns_error_into_command_failed() {
        let mock = MockTransport::new();
        mock.once("AT+CMGF=1", "ERROR\r\n");
        let mut eng = engine(&mock);
        match eng.execute("AT+CMGF=1\r\n").await {
            Err(AtError::CommandFailed { command, response }) => {
                assert_eq!(command, "AT+CMGF=1");
                assert_eq!(response, "ERROR\r\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extended_error_line_ends_expect() {
        let mock = MockTransport::new();
        mock.set_max_chunk(Some(4));
        mock.once("AT+CPMS", "\r\n+CME ERROR: 321\r\n");
        let mut eng = engine(&mock);
        match eng.execute("AT+CPMS=\"MT\"\r\n").await {
            Err(AtError::CommandFailed { response, .. }) => {
                assert_eq!(response, "+CME ERROR: 321\r\n");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_command_without_wait_reads_a_single_byte() {
        let mock = MockTransport::new();
        mock.once("AT+CPMS", "OK\r\n");
        let mut eng = engine(&mock);
        let reply = eng.send_command("AT+CPMS=\"MT\"\r\n", false).await.unwrap();
        assert_eq!(reply, "O");
    }

    #[tokio::test(start_paused = true)]
    async fn io_failure_surfaces_as_link_failure() {
        let mock = MockTransport::new();
        mock.disconnect();
        let mut eng = engine(&mock);
        let err = eng.send_command("AT\r\n", true).await.unwrap_err();
        assert!(err.is_link_failure());
    }
}
