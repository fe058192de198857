//! Test utilities & fixtures.
//! Scripted modems, a throwaway inbox and monitor settings pointing at mock ports.

use smsgate::modem::mock::{MockOpener, MockTransport};
use smsgate::modem::sms::parse_timestamp;
use smsgate::modem::{CommandEngine, EngineTiming, SmsRecord};
use smsgate::monitor::MonitorSettings;
use smsgate::storage::{MessageStore, SharedStore};

pub const CMD_PORT: &str = "/dev/mock-cmd";
pub const NOTIFY_PORT: &str = "/dev/mock-notify";

#[allow(dead_code)]
pub fn record(index: &str, sender: &str, stamp: &str, body: &str) -> SmsRecord {
    SmsRecord {
        index: index.to_string(),
        status: "REC READ".to_string(),
        sender: sender.to_string(),
        timestamp: parse_timestamp(stamp).expect("fixture timestamp"),
        body: body.to_string(),
    }
}

#[allow(dead_code)]
pub fn engine(modem: &MockTransport) -> CommandEngine<MockTransport> {
    CommandEngine::new(modem.clone(), EngineTiming::default())
}

/// Inbox in a fresh temp dir. Keep the `TempDir` alive for the test's duration.
#[allow(dead_code)]
pub fn temp_store() -> (tempfile::TempDir, SharedStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MessageStore::load(dir.path().join("inbox.json")).into_shared();
    (dir, store)
}

#[allow(dead_code)]
pub fn settings() -> MonitorSettings {
    MonitorSettings {
        command_port: CMD_PORT.to_string(),
        notify_port: NOTIFY_PORT.to_string(),
        ..MonitorSettings::default()
    }
}

/// Plug a modem that accepts the init sequence into `opener`. Returns the
/// command and notification transports.
#[allow(dead_code)]
pub fn plug_modem(opener: &MockOpener) -> (MockTransport, MockTransport) {
    let cmd = MockTransport::new();
    cmd.accept_init();
    let notify = MockTransport::new();
    opener.attach(CMD_PORT, cmd.clone());
    opener.attach(NOTIFY_PORT, notify.clone());
    (cmd, notify)
}
