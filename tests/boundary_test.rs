// SPDX-License-Identifier: MIT
//! Boundary cases exercised directly against the stores.

use chrono::{DateTime, Duration, Utc};
use quackd::files::{FileStore, FileType};
use quackd::mailbox::model::MessageStatus;
use quackd::mailbox::{paths, SendRequest};
use quackd::MailboxStore;

fn store() -> MailboxStore {
    let dir = tempfile::tempdir().unwrap().keep();
    MailboxStore::load(&dir).unwrap()
}

fn req(to: &str, from: &str, task: &str) -> SendRequest {
    SendRequest {
        to: to.to_string(),
        from: from.to_string(),
        task: task.to_string(),
        ..Default::default()
    }
}

#[test]
fn path_segment_counts() {
    // 0 segments.
    assert!(paths::validate("", true).is_err());
    // 1 segment, with and without metadata.
    assert!(paths::validate("claude", true).is_ok());
    assert!(paths::validate("claude", false).is_err());
    // 2 and 3 segments.
    assert!(paths::validate("claude/web", false).is_ok());
    assert!(paths::validate("claude/web/reviews", false).is_ok());
    // 4 segments never validate.
    assert!(paths::validate("a/b/c/d", true).is_err());
}

#[tokio::test]
async fn empty_files_list_is_fine() {
    let store = store();
    let out = store.send(req("replit/main", "cursor/dev", "no attachments"), true).await.unwrap();
    assert!(out.message.files.is_empty());
}

#[tokio::test]
async fn ten_megabyte_blob_round_trips() {
    let dir = tempfile::tempdir().unwrap().keep();
    let files = FileStore::load(&dir).unwrap();
    let payload = vec![0x51u8; 10 * 1024 * 1024];
    let meta = files.upload("big.bin", &payload, FileType::Data, None).await.unwrap();
    assert_eq!(meta.size, payload.len() as u64);
    let (_, fetched) = files.get(&meta.id).await.unwrap();
    assert_eq!(fetched.len(), payload.len());
}

#[tokio::test]
async fn reply_chain_of_one_hundred_reconstructs() {
    let store = store();
    let root = store.send(req("replit/main", "cursor/dev", "msg 0"), true).await.unwrap();
    let root_id = root.message.id.clone();

    let mut previous = root_id.clone();
    for i in 1..100 {
        let (to, from) = if i % 2 == 0 {
            ("replit/main", "cursor/dev")
        } else {
            ("cursor/dev", "replit/main")
        };
        let mut r = req(to, from, &format!("msg {i}"));
        r.reply_to = Some(previous.clone());
        let out = store.send(r, true).await.unwrap();
        assert_eq!(out.message.thread_id, root_id);
        previous = out.message.id.clone();
    }

    let thread = store.get_thread(&root_id).await;
    assert_eq!(thread.len(), 100);
    // Every message except the tail was auto-completed by its reply.
    let completed = thread
        .iter()
        .filter(|m| m.status == MessageStatus::Completed)
        .count();
    assert_eq!(completed, 99);
    // Timestamp-ascending order holds across the whole chain.
    for pair in thread.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[tokio::test]
async fn ttl_edges_serve_then_drop() {
    let store = store();
    let out = store.send(req("replit/main", "cursor/dev", "edge"), true).await.unwrap();
    let expires: DateTime<Utc> = DateTime::parse_from_rfc3339(&out.message.expires_at)
        .unwrap()
        .with_timezone(&Utc);

    // One second before expiry the message is served.
    assert_eq!(store.drop_expired(expires - Duration::seconds(1)).await.unwrap(), 0);
    let (visible, _) = store.check_inbox("replit/main", false, false).await.unwrap();
    assert_eq!(visible.len(), 1);

    // One second after expiry it is gone, and the inbox with it.
    assert_eq!(store.drop_expired(expires + Duration::seconds(1)).await.unwrap(), 1);
    assert_eq!(store.inbox_count().await, 0);
}

#[tokio::test]
async fn expired_completed_thread_is_archived_first() {
    let store = store();
    let out = store.send(req("replit/main", "cursor/dev", "done soon"), true).await.unwrap();
    store.update_status(&out.message.id, MessageStatus::InProgress).await.unwrap();
    store.complete(&out.message.id).await.unwrap();

    let expires: DateTime<Utc> = DateTime::parse_from_rfc3339(&out.message.expires_at)
        .unwrap()
        .with_timezone(&Utc);

    // Before expiry nothing is collected; after, the full thread is frozen.
    assert!(store
        .collect_expiring_completed_threads(expires - Duration::seconds(1))
        .await
        .is_empty());
    let expiring = store
        .collect_expiring_completed_threads(expires + Duration::seconds(1))
        .await;
    assert_eq!(expiring.len(), 1);
    assert_eq!(expiring[0].thread_id, out.message.id);
}

#[tokio::test]
async fn approve_and_transition_rejections_leave_state_unchanged() {
    let store = store();
    let out = store.send(req("replit/main", "cursor/dev", "x"), true).await.unwrap();

    // Approving an already-approved message fails and changes nothing.
    assert!(store.approve(&out.message.id).await.is_err());
    let msg = store.get_message(&out.message.id).await.unwrap();
    assert_eq!(msg.status, MessageStatus::Approved);

    // A disallowed transition fails and changes nothing.
    assert!(store.update_status(&out.message.id, MessageStatus::Read).await.is_err());
    let msg = store.get_message(&out.message.id).await.unwrap();
    assert_eq!(msg.status, MessageStatus::Approved);
}
