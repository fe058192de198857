//! SMS text-mode codec: compose, list, read and delete messages.
//!
//! Listing output looks like:
//!
//! ```text
//! +CMGL: 1,"REC UNREAD","+15550001112",,"24/01/02,10:11:12+00"
//! hi there
//! +CMGL: 2,"REC READ","+15550003334",,"24/01/03,08:00:00+02"
//! line one
//! line two
//!
//! OK
//! ```

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use super::engine::CommandEngine;
use super::error::{AtError, AtResult, ParseError};
use super::transport::Transport;
use super::{ends_in_error, CTRL_Z, ERROR_TERMINATOR, OK_TERMINATOR, PROMPT};

/// Marker that starts every entry of an `AT+CMGL` listing.
pub const LISTING_MARKER: &str = "+CMGL:";

/// Marker of an `AT+CMGR` reply.
pub const READ_MARKER: &str = "+CMGR:";

/// Cancels a pending `AT+CMGS` prompt.
const ESCAPE: &str = "\u{1b}";

/// Timestamp layout after the UTC offset has been split off.
const TIMESTAMP_LAYOUT: &str = "%y/%m/%d,%H:%M:%S";

/// One message as reported by the modem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRecord {
    /// Storage slot on the modem. Empty for messages delivered directly via `+CMT`.
    pub index: String,
    pub status: String,
    pub sender: String,
    pub timestamp: DateTime<FixedOffset>,
    pub body: String,
}

/// Parsed listing. Malformed entries end up in `errors`, never abort the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ListingReport {
    pub messages: Vec<SmsRecord>,
    pub errors: Vec<ParseError>,
}

impl ListingReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Raw replies of the link-status queries, line endings trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    /// `AT+CSQ`
    pub signal_quality: String,
    /// `AT+CREG?`
    pub registration: String,
    /// `AT+CPMS=?`
    pub storage: String,
}

impl LinkStats {
    /// The three replies joined by newlines, as shown to callers.
    pub fn to_text(&self) -> String {
        [
            self.signal_quality.as_str(),
            self.registration.as_str(),
            self.storage.as_str(),
        ]
        .join("\n")
    }

    /// RSSI index from `+CSQ: <rssi>,<ber>`; `99` (unknown) maps to `None`.
    pub fn rssi(&self) -> Option<u8> {
        let rest = self.signal_quality.split("+CSQ:").nth(1)?;
        let rssi: u8 = rest.split(',').next()?.trim().parse().ok()?;
        (rssi != 99).then_some(rssi)
    }

    /// Signal strength in dBm per 27.007 (`-113 + 2 * rssi`).
    pub fn rssi_dbm(&self) -> Option<i32> {
        self.rssi().map(|r| -113 + 2 * i32::from(r))
    }
}

/// Parse `YY/MM/DD,HH:MM:SS±ZZ`, where `ZZ` is the offset in whole hours.
pub fn parse_timestamp(text: &str) -> Result<DateTime<FixedOffset>, String> {
    let text = text.trim();
    let split = text
        .rfind(|c: char| c == '+' || c == '-')
        .ok_or_else(|| format!("timestamp {text:?} has no UTC offset"))?;
    let (local, offset) = text.split_at(split);
    let naive = NaiveDateTime::parse_from_str(local, TIMESTAMP_LAYOUT)
        .map_err(|e| format!("bad timestamp {text:?}: {e}"))?;
    let digits = &offset[1..];
    if digits.len() != 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("bad UTC offset {offset:?}"));
    }
    let hours: i32 = digits
        .parse()
        .map_err(|_| format!("bad UTC offset {offset:?}"))?;
    let sign = if offset.starts_with('-') { -1 } else { 1 };
    let zone = FixedOffset::east_opt(sign * hours * 3600)
        .ok_or_else(|| format!("UTC offset {offset:?} out of range"))?;
    naive
        .and_local_timezone(zone)
        .single()
        .ok_or_else(|| format!("ambiguous timestamp {text:?}"))
}

/// Inverse of [`parse_timestamp`].
pub fn format_timestamp(ts: &DateTime<FixedOffset>) -> String {
    let offset = ts.offset().local_minus_utc();
    let sign = if offset < 0 { '-' } else { '+' };
    format!(
        "{}{}{:02}",
        ts.format(TIMESTAMP_LAYOUT),
        sign,
        offset.abs() / 3600
    )
}

fn unquote(field: &str) -> &str {
    field.trim_matches(|c: char| c == '"' || c == ' ')
}

/// Builds a record from the header fields `status, sender, _, date, time`
/// (the index has already been split off) and the body lines.
fn record_from_header(index: String, header: &[&str], body: String) -> Result<SmsRecord, String> {
    if header.len() < 5 {
        return Err(format!(
            "expected status, sender, alpha, date and time fields, found {} field(s)",
            header.len()
        ));
    }
    let date = format!(
        "{},{}",
        unquote(header[3]),
        unquote(header[4].trim_end_matches(|c: char| c == '"' || c == '\r'))
    );
    Ok(SmsRecord {
        index,
        status: unquote(header[0]).to_string(),
        sender: unquote(header[1]).to_string(),
        timestamp: parse_timestamp(&date)?,
        body,
    })
}

/// Splits an entry into header and body. Only the `\r\n` that frames the
/// entry is dropped, so trailing newlines of the body survive.
fn split_entry(entry: &str) -> (&str, String) {
    let entry = entry.trim_start();
    let entry = entry.strip_suffix("\r\n").unwrap_or(entry);
    let mut lines = entry.split('\n');
    let header = lines.next().unwrap_or_default();
    let body = lines.collect::<Vec<_>>().join("\n");
    (header, body)
}

fn parse_listing_entry(entry: &str) -> Result<SmsRecord, String> {
    let (header, body) = split_entry(entry);
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() < 6 {
        return Err(format!(
            "expected 6 metadata fields, found {}",
            fields.len()
        ));
    }
    let index = fields[0].trim();
    if index.is_empty() {
        return Err("empty storage index".to_string());
    }
    record_from_header(index.to_string(), &fields[1..], body)
}

/// Split an `AT+CMGL` reply into records. Text before the first marker (echo,
/// blank lines) is ignored.
pub fn parse_listing(text: &str) -> ListingReport {
    let mut report = ListingReport::default();
    for (segment, entry) in text.split(LISTING_MARKER).skip(1).enumerate() {
        match parse_listing_entry(entry) {
            Ok(record) => report.messages.push(record),
            Err(reason) => {
                warn!("Skipping malformed listing segment {}: {}", segment, reason);
                report.errors.push(ParseError {
                    segment,
                    raw: entry.to_string(),
                    reason,
                });
            }
        }
    }
    report
}

/// Render records the way a modem answers `AT+CMGL`, final `OK` included.
pub fn encode_listing(records: &[SmsRecord]) -> String {
    let mut out = String::from("\r\n");
    for r in records {
        out.push_str(&format!(
            "{} {},\"{}\",\"{}\",,\"{}\"\r\n{}\r\n",
            LISTING_MARKER,
            r.index,
            r.status,
            r.sender,
            format_timestamp(&r.timestamp),
            r.body
        ));
    }
    out.push_str("\r\n");
    out.push_str(OK_TERMINATOR);
    out
}

/// Parse an `AT+CMGR=<index>` reply (terminator already stripped).
pub fn parse_read(index: &str, text: &str) -> Result<SmsRecord, ParseError> {
    let fail = |reason: String| ParseError {
        segment: 0,
        raw: text.to_string(),
        reason,
    };
    let entry = text
        .split(READ_MARKER)
        .nth(1)
        .ok_or_else(|| fail(format!("no {READ_MARKER} header")))?;
    let (header, body) = split_entry(entry);
    let fields: Vec<&str> = header.split(',').collect();
    record_from_header(index.to_string(), &fields, body).map_err(fail)
}

/// Parse a direct `+CMT: "<sender>",,"<date>,<time>"` delivery.
pub fn parse_delivery(header: &str, body: &str) -> Result<SmsRecord, ParseError> {
    let fail = |reason: String| ParseError {
        segment: 0,
        raw: format!("{header}\n{body}"),
        reason,
    };
    let header = header.trim_start_matches("+CMT:").trim();
    let fields: Vec<&str> = header.split(',').collect();
    if fields.len() < 4 {
        return Err(fail(format!("expected 4 header fields, found {}", fields.len())));
    }
    // +CMT carries no status; a fresh delivery is unread.
    let mut with_status = vec!["\"REC UNREAD\""];
    with_status.extend_from_slice(&fields);
    record_from_header(String::new(), &with_status, body.to_string()).map_err(fail)
}

fn check_quoted_arg(what: &str, value: &str) -> AtResult<()> {
    if value.is_empty() || value.contains(|c: char| c == '"' || c == '\r' || c == '\n' || c == CTRL_Z) {
        return Err(AtError::InvalidInput(format!("{what} {value:?}")));
    }
    Ok(())
}

fn trim_reply(text: &str) -> &str {
    let text = text.strip_prefix("\r\n").unwrap_or(text);
    text.strip_suffix("\r\n").unwrap_or(text)
}

/// Send one text-mode SMS.
///
/// Succeeds only when the final reply ends in exactly `OK\r\n`; anything else
/// comes back as [`AtError::SendFailed`] with the raw modem text.
pub async fn send_sms<T: Transport>(
    engine: &mut CommandEngine<T>,
    destination: &str,
    body: &str,
) -> AtResult<()> {
    check_quoted_arg("destination", destination)?;
    if body.contains(CTRL_Z) {
        return Err(AtError::InvalidInput("body contains Ctrl-Z".to_string()));
    }
    info!("Sending SMS to {}", destination);

    engine.send(&format!("AT+CMGS=\"{destination}\"\r"))?;
    match engine.expect(&[PROMPT, ERROR_TERMINATOR]).await {
        Ok(prompt) if prompt.is(PROMPT) => {}
        Ok(rejected) => return Err(AtError::SendFailed(rejected.text)),
        Err(AtError::Timeout { partial }) => {
            // Leave data-entry mode in case the prompt arrived garbled.
            if let Err(e) = engine.send(ESCAPE) {
                if e.is_link_failure() {
                    return Err(e);
                }
                debug!("Could not cancel SMS entry: {}", e);
            }
            return Err(AtError::Timeout { partial });
        }
        Err(e) => return Err(e),
    }

    let reply = engine
        .send_command(&format!("{body}{CTRL_Z}"), true)
        .await?;
    if reply.ends_with(OK_TERMINATOR) {
        debug!("SMS to {} accepted", destination);
        Ok(())
    } else {
        warn!("Error sending SMS: {:?}", reply);
        Err(AtError::SendFailed(reply))
    }
}

/// List stored messages matching `filter` (`ALL`, `REC UNREAD`, ...).
pub async fn list_sms<T: Transport>(
    engine: &mut CommandEngine<T>,
    filter: &str,
) -> AtResult<ListingReport> {
    check_quoted_arg("filter", filter)?;
    debug!("Listing SMS ({})", filter);
    let command = format!("AT+CMGL=\"{filter}\"");
    engine.send(&format!("{command}\r\n"))?;
    let text = match engine.read_until(OK_TERMINATOR).await {
        Ok(text) => text,
        Err(AtError::Timeout { partial }) if ends_in_error(&partial) => {
            return Err(AtError::CommandFailed {
                command,
                response: partial,
            });
        }
        Err(e) => return Err(e),
    };
    Ok(parse_listing(trim_reply(&text)))
}

/// Read a single message by storage index.
pub async fn read_sms<T: Transport>(
    engine: &mut CommandEngine<T>,
    index: &str,
) -> AtResult<SmsRecord> {
    engine.send(&format!("AT+CMGR={index}\r\n"))?;
    let text = match engine.read_until(OK_TERMINATOR).await {
        Ok(text) => text,
        Err(AtError::Timeout { partial }) if ends_in_error(&partial) => {
            return Err(AtError::ReadFailed(partial));
        }
        Err(e) => return Err(e),
    };
    Ok(parse_read(index, trim_reply(&text))?)
}

/// Delete the message in storage slot `index`.
pub async fn delete_sms<T: Transport>(engine: &mut CommandEngine<T>, index: &str) -> AtResult<()> {
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AtError::InvalidInput(format!("storage index {index:?}")));
    }
    info!("Deleting SMS {}", index);
    engine.send(&format!("AT+CMGD={index}\r\n"))?;
    let reply = engine.expect(&[OK_TERMINATOR, ERROR_TERMINATOR]).await?;
    if reply.is(OK_TERMINATOR) {
        Ok(())
    } else {
        Err(AtError::DeleteFailed(reply.text))
    }
}

/// Query signal quality, network registration and storage usage.
pub async fn link_stats<T: Transport>(engine: &mut CommandEngine<T>) -> AtResult<LinkStats> {
    let mut replies = Vec::with_capacity(3);
    for cmd in ["AT+CSQ\r\n", "AT+CREG?\r\n", "AT+CPMS=?\r\n"] {
        engine.send(cmd)?;
        let text = engine.read_until(OK_TERMINATOR).await?;
        replies.push(trim_reply(&text).trim_end_matches(|c: char| c == '\r' || c == '\n').to_string());
    }
    let storage = replies.pop().unwrap_or_default();
    let registration = replies.pop().unwrap_or_default();
    let signal_quality = replies.pop().unwrap_or_default();
    Ok(LinkStats {
        signal_quality,
        registration,
        storage,
    })
}
