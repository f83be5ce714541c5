//! On-demand backfill against a fake client.

mod common;

use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};

use common::test_app;
use wacli::app::BackfillOptions;
use wacli::store::UpsertMessageParams;
use wacli::wa::{HistoryConversation, HistorySyncEvent, MessageEvent};

const CHAT: &str = "123@s.whatsapp.net";

fn history_message(id: &str, ts: i64, text: &str) -> MessageEvent {
    MessageEvent {
        chat_jid: CHAT.into(),
        msg_id: id.into(),
        sender_jid: CHAT.into(),
        sender_name: "Alice".into(),
        timestamp: Some(Utc.timestamp_opt(ts, 0).unwrap()),
        from_me: false,
        text: text.into(),
        media: None,
    }
}

#[tokio::test]
async fn backfill_adds_older_messages_and_moves_the_cursor() -> Result<()> {
    let (_dir, app, fake) = test_app();
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();

    app.store()
        .upsert_chat(CHAT, "dm", "Alice", Some(base))?;
    app.store().upsert_message(&UpsertMessageParams {
        chat_jid: CHAT.into(),
        msg_id: "m2".into(),
        sender_jid: CHAT.into(),
        sender_name: "Alice".into(),
        timestamp: Some(base + chrono::Duration::seconds(2)),
        text: "newer".into(),
        ..Default::default()
    })?;

    let older_ts = (base + chrono::Duration::seconds(1)).timestamp();
    fake.set_on_demand_history(move |anchor, count| {
        assert_eq!(anchor.chat_jid, CHAT);
        assert_eq!(anchor.msg_id, "m2");
        assert_eq!(count, 50);
        HistorySyncEvent {
            on_demand: true,
            conversations: vec![HistoryConversation {
                chat_jid: CHAT.into(),
                chat_name: "Alice".into(),
                end_of_history: true,
                messages: vec![history_message("m1", older_ts, "older")],
            }],
        }
    });

    let summary = app
        .backfill_history(BackfillOptions {
            chat_jid: CHAT.into(),
            count: 50,
            requests: 1,
            wait_per_request: Duration::from_secs(1),
            idle_exit: Duration::from_millis(200),
        })
        .await?;

    assert!(summary.messages_added >= 1, "expected messages to be added");
    assert_eq!(summary.requests_sent, 1);
    assert!(summary.reached_end);

    let oldest = app.store().get_oldest_message_info(CHAT)?;
    assert_eq!(oldest.msg_id, "m1");

    // The backfill handler and waiter are gone once the loop returns.
    assert_eq!(fake.handler_count(), 0);
    Ok(())
}

#[tokio::test]
async fn backfill_with_no_local_history_anchors_at_now() -> Result<()> {
    let (_dir, app, fake) = test_app();

    fake.set_on_demand_history(|anchor, _count| {
        assert!(anchor.msg_id.is_empty());
        assert!(anchor.timestamp.is_some());
        HistorySyncEvent {
            on_demand: true,
            conversations: vec![HistoryConversation {
                chat_jid: CHAT.into(),
                chat_name: String::new(),
                end_of_history: true,
                messages: vec![],
            }],
        }
    });

    let summary = app
        .backfill_history(BackfillOptions {
            chat_jid: CHAT.into(),
            count: 10,
            requests: 1,
            wait_per_request: Duration::from_secs(1),
            idle_exit: Duration::from_millis(200),
        })
        .await?;
    assert!(summary.reached_end);
    assert_eq!(summary.messages_added, 0);
    Ok(())
}

#[tokio::test]
async fn backfill_gives_up_after_idle_exit_without_responses() -> Result<()> {
    let (_dir, app, _fake) = test_app();
    // No on-demand callback: requests go unanswered.

    let summary = app
        .backfill_history(BackfillOptions {
            chat_jid: CHAT.into(),
            count: 10,
            requests: 5,
            wait_per_request: Duration::from_millis(50),
            idle_exit: Duration::from_millis(10),
        })
        .await?;

    assert!(summary.requests_sent >= 1);
    assert_eq!(summary.messages_added, 0);
    assert!(!summary.reached_end);
    Ok(())
}

#[tokio::test]
async fn backfill_requires_a_chat() {
    let (_dir, app, _fake) = test_app();
    let err = app
        .backfill_history(BackfillOptions {
            chat_jid: "  ".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, wacli::Error::InvalidArgument(_)));
}
