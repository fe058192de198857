mod common;

use smsgate::storage::{MessageStore, PersistedMessage};

fn sample(n: usize) -> Vec<PersistedMessage> {
    (0..n)
        .map(|i| {
            PersistedMessage::new(common::record(
                &i.to_string(),
                "+15550001112",
                "24/01/02,10:11:12+00",
                &format!("message {i}\nsecond line"),
            ))
        })
        .collect()
}

#[test]
fn appended_messages_reload_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.json");

    let mut store = MessageStore::load(&path);
    assert!(store.is_empty());
    let messages = sample(3);
    for m in &messages {
        store.append(m.clone());
    }

    let reloaded = MessageStore::load(&path);
    assert_eq!(reloaded.messages(), messages.as_slice());
    assert_eq!(reloaded.get(&messages[1].id), Some(&messages[1]));
}

#[test]
fn delete_is_idempotent_and_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.json");
    let mut store = MessageStore::load(&path);
    let messages = sample(2);
    for m in &messages {
        store.append(m.clone());
    }

    assert!(store.delete(&messages[0].id));
    assert!(!store.delete(&messages[0].id));
    assert_eq!(store.len(), 1);

    let reloaded = MessageStore::load(&path);
    assert_eq!(reloaded.messages(), &messages[1..]);
}

#[test]
fn backing_file_is_a_flat_json_array() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("inbox.json");
    let mut store = MessageStore::load(&path);
    let msg = sample(1).remove(0);
    store.append(msg.clone());

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let entry = &value.as_array().unwrap()[0];
    assert_eq!(entry["id"], msg.id.as_str());
    assert_eq!(entry["sender"], "+15550001112");
    assert_eq!(entry["body"], "message 0\nsecond line");

    // No temp files left behind.
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn shared_store_serializes_concurrent_appends() {
    let (dir, store) = common::temp_store();
    let mut tasks = Vec::new();
    for m in sample(8) {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.lock().await.append(m);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(store.lock().await.len(), 8);
    let reloaded = MessageStore::load(dir.path().join("inbox.json"));
    assert_eq!(reloaded.len(), 8);
}

#[test]
fn delete_by_a_second_process_is_not_undone_by_the_first() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.json");
    let messages = sample(2);

    let mut daemon = MessageStore::load(&path);
    daemon.append(messages[0].clone());

    let mut cli = MessageStore::load(&path);
    assert!(cli.delete(&messages[0].id));

    daemon.append(messages[1].clone());
    assert_eq!(daemon.messages(), &messages[1..]);
    let reloaded = MessageStore::load(&path);
    assert_eq!(reloaded.messages(), &messages[1..]);
    assert!(reloaded.get(&messages[0].id).is_none());
}

#[test]
fn refresh_picks_up_appends_from_another_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inbox.json");
    let messages = sample(1);

    let mut reader = MessageStore::load(&path);
    let mut writer = MessageStore::load(&path);
    writer.append(messages[0].clone());
    assert!(reader.is_empty());

    reader.refresh();
    assert_eq!(reader.messages(), messages.as_slice());
}
