mod common;

use smsgate::modem::mock::MockOpener;
use smsgate::modem::AtError;
use smsgate::monitor::{Monitor, MonitorHandle, MonitorState};
use smsgate::storage::{MessageStore, PersistedMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn start(opener: &MockOpener) -> (MonitorHandle, watch::Sender<bool>, tempfile::TempDir) {
    let (dir, store) = common::temp_store();
    let monitor = Monitor::new(common::settings(), Arc::new(opener.clone()), store);
    let handle = monitor.handle();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(monitor.run(stop_rx));
    (handle, stop_tx, dir)
}

async fn wait_for_inbox(handle: &MonitorHandle, count: usize) {
    for _ in 0..500 {
        if handle.stored_messages().await.len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("inbox never reached {count} message(s)");
}

#[tokio::test(start_paused = true)]
async fn hot_plug_cycle() {
    let opener = MockOpener::new();
    let (handle, _stop, _dir) = start(&opener);

    // No device at startup: waiting, timer armed.
    let waiting = handle.wait_for(|s| s.recheck_armed).await;
    assert_eq!(waiting.state, MonitorState::NoDevice);
    assert_eq!(waiting.generation, 0);

    // Plug in; the recheck picks it up.
    let (cmd, _notify) = common::plug_modem(&opener);
    let ready = handle.wait_for(|s| s.state == MonitorState::Ready).await;
    assert!(!ready.recheck_armed);
    assert_eq!(ready.generation, 1);
    let written = cmd.written();
    assert_eq!(written.first().map(String::as_str), Some("ATE0\r\n"));
    assert!(written.iter().any(|w| w == "AT+CMGF=1\r\n"));

    // Pull the plug; the presence check notices.
    opener.detach(common::CMD_PORT);
    cmd.disconnect();
    let lost = handle.wait_for(|s| s.state == MonitorState::NoDevice).await;
    assert!(lost.recheck_armed);
    assert_eq!(lost.generation, 1);
    assert!(matches!(
        handle.list_sms("ALL").await,
        Err(AtError::DeviceNotReady)
    ));

    // Plug back in: a fresh session with a new generation.
    let (cmd2, _notify2) = common::plug_modem(&opener);
    let again = handle.wait_for(|s| s.state == MonitorState::Ready).await;
    assert_eq!(again.generation, 2);
    assert_eq!(cmd2.written().first().map(String::as_str), Some("ATE0\r\n"));
}

#[tokio::test(start_paused = true)]
async fn new_message_indication_lands_in_inbox() {
    let opener = MockOpener::new();
    let (cmd, notify) = common::plug_modem(&opener);
    cmd.always(
        "AT+CMGR=5",
        "\r\n+CMGR: \"REC UNREAD\",\"+15550001112\",,\"24/01/02,10:11:12+00\"\r\nhello there\r\n\r\nOK\r\n",
    );
    cmd.always("AT+CMGD=5", "\r\nOK\r\n");
    let (handle, _stop, dir) = start(&opener);
    handle.wait_for(|s| s.state == MonitorState::Ready).await;

    notify.push_inbound("\r\n+CMTI: \"MT\",5\r\n");
    wait_for_inbox(&handle, 1).await;

    let stored = handle.stored_messages().await;
    assert_eq!(stored[0].record.index, "5");
    assert_eq!(stored[0].record.sender, "+15550001112");
    assert_eq!(stored[0].record.body, "hello there");
    assert!(cmd.written().iter().any(|w| w == "AT+CMGD=5\r\n"));

    // The file is already up to date.
    let on_disk = std::fs::read_to_string(dir.path().join("inbox.json")).unwrap();
    assert!(on_disk.contains(&stored[0].id));
}

#[tokio::test(start_paused = true)]
async fn direct_delivery_is_stored_without_a_read() {
    let opener = MockOpener::new();
    let (cmd, notify) = common::plug_modem(&opener);
    let (handle, _stop, _dir) = start(&opener);
    handle.wait_for(|s| s.state == MonitorState::Ready).await;
    let before = cmd.written().len();

    notify.push_inbound("+CMT: \"+15550009999\",,\"24/03/01,12:00:00+02\"\r\nping\r\n");
    wait_for_inbox(&handle, 1).await;

    let stored = handle.stored_messages().await;
    assert_eq!(stored[0].record.body, "ping");
    assert_eq!(stored[0].record.index, "");
    assert_eq!(cmd.written().len(), before);
}

#[tokio::test(start_paused = true)]
async fn command_port_failure_ends_the_session() {
    let opener = MockOpener::new();
    let (cmd, _notify) = common::plug_modem(&opener);
    let (handle, _stop, _dir) = start(&opener);
    handle.wait_for(|s| s.state == MonitorState::Ready).await;

    // The device node is still there, but writes fail.
    cmd.disconnect();
    let err = handle.send_sms("+15551234567", "hi").await.unwrap_err();
    assert!(err.is_link_failure());

    let status = handle.wait_for(|s| s.state == MonitorState::NoDevice).await;
    assert!(status.recheck_armed);
}

#[tokio::test(start_paused = true)]
async fn handle_operations_share_the_session() {
    let opener = MockOpener::new();
    let (cmd, _notify) = common::plug_modem(&opener);
    cmd.always("AT+CMGS", "> ");
    cmd.always("body", "\r\nOK\r\n");
    cmd.always("AT+CMGD=2", "\r\nOK\r\n");
    let (handle, _stop, _dir) = start(&opener);
    handle.wait_for(|s| s.state == MonitorState::Ready).await;

    let a = handle.clone();
    let b = handle.clone();
    let (sent, deleted) = tokio::join!(a.send_sms("+1555", "body"), b.delete_sms("2"));
    sent.unwrap();
    deleted.unwrap();
    assert!(handle.is_ready());
}

#[tokio::test(start_paused = true)]
async fn stored_messages_survive_device_loss() {
    let opener = MockOpener::new();
    let (cmd, notify) = common::plug_modem(&opener);
    cmd.always(
        "AT+CMGR=1",
        "\r\n+CMGR: \"REC UNREAD\",\"+1555\",,\"24/01/02,10:11:12+00\"\r\nkeep me\r\n\r\nOK\r\n",
    );
    cmd.always("AT+CMGD=1", "\r\nOK\r\n");
    let (handle, _stop, _dir) = start(&opener);
    handle.wait_for(|s| s.state == MonitorState::Ready).await;
    notify.push_inbound("+CMTI: \"MT\",1\r\n");
    wait_for_inbox(&handle, 1).await;

    opener.detach(common::CMD_PORT);
    handle.wait_for(|s| s.state == MonitorState::NoDevice).await;

    let stored = handle.stored_messages().await;
    assert_eq!(stored.len(), 1);
    assert!(handle.delete_stored(&stored[0].id).await);
    assert!(!handle.delete_stored(&stored[0].id).await);
    assert!(handle.stored_messages().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn inbox_edits_from_another_process_are_visible() {
    let opener = MockOpener::new();
    let (handle, _stop, dir) = start(&opener);
    let mut other = MessageStore::load(dir.path().join("inbox.json"));
    let msg = PersistedMessage::new(common::record(
        "1",
        "+1555",
        "24/01/02,10:11:12+00",
        "from the cli",
    ));

    other.append(msg.clone());
    assert_eq!(handle.stored_messages().await, vec![msg.clone()]);

    assert!(other.delete(&msg.id));
    assert!(handle.stored_messages().await.is_empty());
    assert!(!handle.delete_stored(&msg.id).await);
}

#[test]
fn operations_fail_fast_without_a_device() {
    let opener = MockOpener::new();
    let (_dir, store) = common::temp_store();
    let monitor = Monitor::new(common::settings(), Arc::new(opener), store);
    let handle = monitor.handle();

    let mut list = tokio_test::task::spawn(handle.list_sms("ALL"));
    assert!(matches!(
        tokio_test::assert_ready!(list.poll()),
        Err(AtError::DeviceNotReady)
    ));
    let mut send = tokio_test::task::spawn(handle.send_sms("+1555", "hi"));
    assert!(matches!(
        tokio_test::assert_ready!(send.poll()),
        Err(AtError::DeviceNotReady)
    ));
    assert!(!handle.is_ready());
}
