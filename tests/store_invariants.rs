//! Store-level invariants exercised through the public API: widening-upsert
//! convergence, monotonic chat recency, atomic participant replacement, and
//! reader/writer coexistence.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};

use wacli::lock::StoreLock;
use wacli::store::{
    GroupParticipant, ListMessagesParams, SearchMessagesParams, Store, UpsertMessageParams,
};

const CHAT: &str = "123@s.whatsapp.net";

fn ts(secs: i64) -> Option<DateTime<Utc>> {
    Some(Utc.timestamp_opt(secs, 0).unwrap())
}

fn open_store(dir: &tempfile::TempDir) -> Store {
    Store::open(&dir.path().join("wacli.db")).expect("open store")
}

/// The three shapes the protocol delivers the same message in.
fn shapes() -> Vec<UpsertMessageParams> {
    let live = UpsertMessageParams {
        chat_jid: CHAT.into(),
        msg_id: "m1".into(),
        sender_jid: CHAT.into(),
        sender_name: "Alice".into(),
        timestamp: ts(1_000),
        text: "hello".into(),
        ..Default::default()
    };
    let history = UpsertMessageParams {
        chat_jid: CHAT.into(),
        msg_id: "m1".into(),
        timestamp: ts(995),
        display_text: "hello".into(),
        ..Default::default()
    };
    let media = UpsertMessageParams {
        chat_jid: CHAT.into(),
        msg_id: "m1".into(),
        timestamp: ts(1_000),
        media_type: "image".into(),
        filename: "pic.jpg".into(),
        mime_type: "image/jpeg".into(),
        direct_path: "/d".into(),
        media_key: Some(vec![1, 2, 3]),
        file_length: 9,
        ..Default::default()
    };
    vec![live, history, media]
}

fn permutations(n: usize) -> Vec<Vec<usize>> {
    if n == 1 {
        return vec![vec![0]];
    }
    let mut out = Vec::new();
    for perm in permutations(n - 1) {
        for slot in 0..n {
            let mut next = perm.clone();
            next.insert(slot, n - 1);
            out.push(next);
        }
    }
    out
}

#[test]
fn widening_upserts_converge_in_any_order() -> Result<()> {
    let shapes = shapes();
    let mut fingerprints = Vec::new();

    for perm in permutations(shapes.len()) {
        let dir = tempfile::tempdir()?;
        let store = open_store(&dir);
        for &i in &perm {
            store.upsert_message(&shapes[i])?;
        }
        let msg = store.get_message(CHAT, "m1")?;
        let media = store.get_media_download_info(CHAT, "m1")?;
        fingerprints.push((
            msg.text,
            msg.display_text,
            msg.timestamp,
            media.media_type,
            media.direct_path,
            media.media_key,
            media.file_length,
        ));
    }

    let first = &fingerprints[0];
    assert!(
        fingerprints.iter().all(|f| f == first),
        "final row must not depend on delivery order"
    );
    assert_eq!(first.0, "hello");
    assert_eq!(first.2, ts(1_000), "timestamp advances to the max observed");
    assert_eq!(first.3, "image");
    assert_eq!(first.5, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn applying_the_same_shapes_twice_changes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir);
    for shape in &shapes() {
        store.upsert_message(shape)?;
    }
    let before = store.get_message(CHAT, "m1")?;
    for shape in &shapes() {
        assert!(!store.upsert_message(shape)?, "re-delivery is not new");
    }
    let after = store.get_message(CHAT, "m1")?;
    assert_eq!(before.text, after.text);
    assert_eq!(before.timestamp, after.timestamp);
    assert_eq!(before.display_text, after.display_text);
    Ok(())
}

#[test]
fn chat_recency_is_the_max_of_observed_timestamps() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir);
    for (observed, expected_last) in [(1_000, 1_000), (900, 1_000), (1_500, 1_500), (1_200, 1_500)]
    {
        store.upsert_chat(CHAT, "dm", "Alice", ts(observed))?;
        assert_eq!(store.get_chat(CHAT)?.last_message_ts, ts(expected_last));
    }
    Ok(())
}

#[test]
fn participant_replacement_is_atomic_under_failure() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open_store(&dir);
    let group = "9@g.us";

    let snapshot = vec![
        GroupParticipant {
            group_jid: group.into(),
            user_jid: "a@s.whatsapp.net".into(),
            role: "member".into(),
        },
        GroupParticipant {
            group_jid: group.into(),
            user_jid: "b@s.whatsapp.net".into(),
            role: "admin".into(),
        },
    ];
    store.replace_group_participants(group, &snapshot)?;

    // A duplicate row aborts the transaction partway through the inserts.
    let poisoned = vec![
        GroupParticipant {
            group_jid: group.into(),
            user_jid: "c@s.whatsapp.net".into(),
            role: "member".into(),
        },
        GroupParticipant {
            group_jid: group.into(),
            user_jid: "c@s.whatsapp.net".into(),
            role: "member".into(),
        },
    ];
    assert!(store.replace_group_participants(group, &poisoned).is_err());

    let after = store.list_group_participants(group)?;
    assert_eq!(after.len(), 2, "pre-call snapshot must survive the failure");
    assert_eq!(after[0].user_jid, "a@s.whatsapp.net");
    assert_eq!(after[1].user_jid, "b@s.whatsapp.net");

    // And the failed snapshot is fully absent, not half-applied.
    assert!(after.iter().all(|p| p.user_jid != "c@s.whatsapp.net"));
    Ok(())
}

#[test]
fn reader_sees_writer_snapshot_without_the_lock() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let _lock = StoreLock::acquire(dir.path())?;

    // Writer (this process, holding the lock) populates the store.
    let writer = open_store(&dir);
    writer.upsert_chat(CHAT, "dm", "Alice", ts(1_000))?;
    writer.upsert_message(&UpsertMessageParams {
        chat_jid: CHAT.into(),
        msg_id: "m1".into(),
        sender_jid: CHAT.into(),
        timestamp: ts(1_000),
        text: "visible".into(),
        ..Default::default()
    })?;

    // Reader opens the same database with no lock at all.
    let reader = Store::open_read_only(&dir.path().join("wacli.db"))?;
    let msgs = reader.list_messages(&ListMessagesParams {
        chat_jid: CHAT.into(),
        ..Default::default()
    })?;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].text, "visible");

    let hits = reader.search_messages(&SearchMessagesParams {
        query: "visible".into(),
        ..Default::default()
    })?;
    assert_eq!(hits.len(), 1);
    Ok(())
}
