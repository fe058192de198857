//! Scripted transport for exercising the engine and monitor without hardware.
//!
//! [`MockTransport`] is a cloneable handle to shared state: a test keeps one
//! clone to push unsolicited bytes, inspect what was written, or pull the plug,
//! while the engine owns the other.
//!
//! ```
//! use smsgate::modem::mock::MockTransport;
//!
//! let modem = MockTransport::new();
//! // Every write beginning with "AT+CMGF" is answered with OK.
//! modem.always("AT+CMGF", "OK\r\n");
//! // The next write beginning with "AT+CMGD=3" is answered once with ERROR.
//! modem.once("AT+CMGD=3", "ERROR\r\n");
//! ```

use std::collections::{HashMap, VecDeque};
use std::io::{Error, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};

use super::error::{AtError, AtResult};
use super::transport::{DeviceOpener, Transport};

#[derive(Debug, Clone)]
struct Rule {
    prefix: Vec<u8>,
    response: Vec<u8>,
    persistent: bool,
}

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<u8>,
    rules: Vec<Rule>,
    written: Vec<Vec<u8>>,
    discards: usize,
    max_chunk: Option<usize>,
    disconnected: bool,
    failing_writes: Vec<Vec<u8>>,
}

/// In-memory modem link. See the module docs.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Answer the next write starting with `prefix` with `response`, once.
    pub fn once(&self, prefix: &str, response: &str) {
        self.lock().rules.push(Rule {
            prefix: prefix.as_bytes().to_vec(),
            response: response.as_bytes().to_vec(),
            persistent: false,
        });
    }

    /// Answer every write starting with `prefix` with `response`.
    pub fn always(&self, prefix: &str, response: &str) {
        self.lock().rules.push(Rule {
            prefix: prefix.as_bytes().to_vec(),
            response: response.as_bytes().to_vec(),
            persistent: true,
        });
    }

    /// Script the replies of a modem that accepts the default init sequence.
    pub fn accept_init(&self) {
        for cmd in ["ATE0", "AT+CMEE", "AT+CPMS", "AT+CMGF", "AT+CNMI"] {
            self.always(cmd, "OK\r\n");
        }
    }

    /// Make bytes available to the next reads, as if the modem sent them
    /// unprompted.
    pub fn push_inbound(&self, data: &str) {
        self.lock().inbound.extend(data.as_bytes());
    }

    /// Limit how many bytes a single `read` hands back.
    pub fn set_max_chunk(&self, max: Option<usize>) {
        self.lock().max_chunk = max;
    }

    /// Simulate the device disappearing: all further I/O fails.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Make every write starting with `prefix` fail as if the device were gone.
    pub fn fail_writes(&self, prefix: &str) {
        self.lock().failing_writes.push(prefix.as_bytes().to_vec());
    }

    /// Every write so far, decoded lossily.
    pub fn written(&self) -> Vec<String> {
        self.lock()
            .written
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    pub fn written_raw(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// How many times pending input was discarded before a write.
    pub fn discard_count(&self) -> usize {
        self.lock().discards
    }

    pub fn pending_inbound(&self) -> usize {
        self.lock().inbound.len()
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(Error::new(ErrorKind::BrokenPipe, "mock device removed"));
        }
        let limit = state.max_chunk.unwrap_or(usize::MAX).min(buf.len());
        let mut n = 0;
        while n < limit {
            match state.inbound.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        let mut state = self.lock();
        if state.disconnected || state.failing_writes.iter().any(|p| data.starts_with(p)) {
            return Err(Error::new(ErrorKind::BrokenPipe, "mock device removed"));
        }
        state.written.push(data.to_vec());
        if let Some(pos) = state.rules.iter().position(|r| data.starts_with(&r.prefix)) {
            let rule = if state.rules[pos].persistent {
                state.rules[pos].clone()
            } else {
                state.rules.remove(pos)
            };
            state.inbound.extend(rule.response);
        }
        Ok(())
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(Error::new(ErrorKind::BrokenPipe, "mock device removed"));
        }
        state.inbound.clear();
        state.discards += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OpenerState {
    queued: HashMap<String, VecDeque<MockTransport>>,
    present: HashMap<String, bool>,
    attempts: HashMap<String, usize>,
}

/// Hands out queued [`MockTransport`]s by device path.
#[derive(Debug, Clone, Default)]
pub struct MockOpener {
    state: Arc<Mutex<OpenerState>>,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, OpenerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Plug a device in: the next `open(path)` returns `transport`.
    pub fn attach(&self, path: &str, transport: MockTransport) {
        let mut state = self.lock();
        state
            .queued
            .entry(path.to_string())
            .or_default()
            .push_back(transport);
        state.present.insert(path.to_string(), true);
    }

    /// Unplug: the path stops being present and queued transports are dropped.
    pub fn detach(&self, path: &str) {
        let mut state = self.lock();
        state.queued.remove(path);
        state.present.insert(path.to_string(), false);
    }

    pub fn open_attempts(&self, path: &str) -> usize {
        self.lock().attempts.get(path).copied().unwrap_or(0)
    }
}

impl DeviceOpener for MockOpener {
    fn open(&self, path: &str, _baud_rate: u32) -> AtResult<Box<dyn Transport>> {
        let mut state = self.lock();
        *state.attempts.entry(path.to_string()).or_default() += 1;
        match state.queued.get_mut(path).and_then(|q| q.pop_front()) {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(AtError::Open {
                path: path.to_string(),
                reason: "no such device".to_string(),
            }),
        }
    }

    fn is_present(&self, path: &str) -> bool {
        self.lock().present.get(path).copied().unwrap_or(false)
    }
}
