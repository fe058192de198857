//! Unsolicited result codes from the notification port.
//!
//! The modem pushes lines such as `+CMTI: "MT",3` or `^RSSI:17` without being
//! asked. [`LineSplitter`] turns the raw byte stream into lines and
//! [`Notification::parse`] classifies each one.

use log::warn;

use super::error::ParseError;
use super::sms::{parse_delivery, SmsRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// `+CMTI: "<mem>",<index>`: a message was stored at `index`.
    NewMessage { storage: String, index: String },
    /// `+CMT:` header followed by the body line: a message routed straight to us.
    Delivered(SmsRecord),
    /// `^RSSI:<n>` or `+CSQ: <n>,<ber>`.
    SignalQuality(u8),
    /// `+CREG: <stat>` or `^SRVST:<n>`, kept raw.
    Registration(String),
    Other(String),
}

impl Notification {
    /// Classify one line (without its line ending). `+CMT:` headers are handled
    /// by [`LineSplitter`] because they span two lines.
    pub fn parse(line: &str) -> Notification {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("+CMTI:") {
            let mut parts = rest.splitn(2, ',');
            let storage = parts.next().unwrap_or_default().trim().trim_matches('"');
            if let Some(index) = parts.next().map(str::trim).filter(|i| !i.is_empty()) {
                return Notification::NewMessage {
                    storage: storage.to_string(),
                    index: index.to_string(),
                };
            }
        } else if let Some(rest) = line.strip_prefix("^RSSI:") {
            if let Ok(n) = rest.trim().parse() {
                return Notification::SignalQuality(n);
            }
        } else if let Some(rest) = line.strip_prefix("+CSQ:") {
            if let Some(Ok(n)) = rest.split(',').next().map(|v| v.trim().parse()) {
                return Notification::SignalQuality(n);
            }
        } else if line.starts_with("+CREG:") || line.starts_with("^SRVST:") {
            return Notification::Registration(line.to_string());
        }
        Notification::Other(line.to_string())
    }
}

/// Longest unterminated input kept while waiting for a line ending.
pub const MAX_LINE_LEN: usize = 4096;

/// Incremental `\r\n` line splitter for the notification stream.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
    pending_delivery: Option<String>,
    /// Set after an overlong line was dropped; the rest of it is skipped.
    discarding: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered without a line ending yet.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed raw bytes; returns every notification completed by them. Blank lines
    /// are skipped. A line longer than [`MAX_LINE_LEN`] is dropped whole.
    pub fn push(&mut self, data: &[u8]) -> Vec<Result<Notification, ParseError>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');

            if let Some(header) = self.pending_delivery.take() {
                out.push(parse_delivery(&header, line).map(Notification::Delivered));
                continue;
            }
            if line.trim().is_empty() {
                continue;
            }
            if line.starts_with("+CMT:") {
                self.pending_delivery = Some(line.to_string());
                continue;
            }
            out.push(Ok(Notification::parse(line)));
        }
        if self.buf.len() > MAX_LINE_LEN {
            warn!(
                "Dropping {} bytes of notification input with no line ending",
                self.buf.len()
            );
            self.buf.clear();
            self.discarding = true;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_message_indication() {
        assert_eq!(
            Notification::parse("+CMTI: \"MT\",12"),
            Notification::NewMessage {
                storage: "MT".into(),
                index: "12".into()
            }
        );
    }

    #[test]
    fn parses_signal_and_registration() {
        assert_eq!(Notification::parse("^RSSI:17"), Notification::SignalQuality(17));
        assert_eq!(Notification::parse("+CSQ: 21,99"), Notification::SignalQuality(21));
        assert_eq!(
            Notification::parse("+CREG: 1"),
            Notification::Registration("+CREG: 1".into())
        );
        assert_eq!(Notification::parse("^BOOT:1,0"), Notification::Other("^BOOT:1,0".into()));
    }

    #[test]
    fn malformed_cmti_falls_back_to_other() {
        assert_eq!(
            Notification::parse("+CMTI: \"MT\""),
            Notification::Other("+CMTI: \"MT\"".into())
        );
    }

    #[test]
    fn splitter_handles_partial_lines_and_deliveries() {
        let mut s = LineSplitter::new();
        assert!(s.push(b"\r\n+CMTI: \"MT\",").is_empty());
        let got = s.push(b"3\r\n+CMT: \"+1555\",,\"24/01/02,10:11:12+00\"\r\nhi\r\n");
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[0].as_ref().unwrap(),
            &Notification::NewMessage {
                storage: "MT".into(),
                index: "3".into()
            }
        );
        match got[1].as_ref().unwrap() {
            Notification::Delivered(rec) => {
                assert_eq!(rec.sender, "+1555");
                assert_eq!(rec.body, "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overlong_line_is_dropped_and_the_stream_recovers() {
        let mut s = LineSplitter::new();
        for _ in 0..(MAX_LINE_LEN / 512 + 2) {
            assert!(s.push(&[b'x'; 512]).is_empty());
            assert!(s.buffered() <= MAX_LINE_LEN);
        }
        let got = s.push(b"still garbage\r\n+CMTI: \"MT\",4\r\n");
        assert_eq!(got.len(), 1);
        assert_eq!(
            got[0].as_ref().unwrap(),
            &Notification::NewMessage {
                storage: "MT".into(),
                index: "4".into()
            }
        );
    }
}
