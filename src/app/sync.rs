//! The live sync loop: stream protocol events into the store.
//!
//! Handlers run on library tasks and must stay lock-free with respect to App
//! bookkeeping, so everything they need is captured up front in a
//! [`SyncContext`] of `Arc`s. The loop itself only parks on the activity
//! signal and the idle timer.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Notify};

use super::media::MediaJob;
use super::{App, SessionCell, SessionState};
use crate::config::DEFAULT_IDLE_EXIT;
use crate::errors::{Error, Result};
use crate::store::{Store, UpsertMessageParams};
use crate::wa::{
    EventHandler, HistoryConversation, HistorySyncEvent, Jid, MessageEvent, WaEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Run until the stream has been idle for `idle_exit`, then return.
    Once,
    /// Run until cancelled.
    Follow,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub download_media: bool,
    pub refresh_contacts: bool,
    pub refresh_groups: bool,
    pub idle_exit: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            mode: SyncMode::Follow,
            download_media: false,
            refresh_contacts: false,
            refresh_groups: false,
            idle_exit: DEFAULT_IDLE_EXIT,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub messages_stored: u64,
}

/// Everything an event handler may touch. No App references, no App locks.
pub(crate) struct SyncContext {
    pub store: Store,
    pub session: Arc<SessionCell>,
    pub activity: Arc<Notify>,
    pub messages_stored: Arc<AtomicU64>,
    pub backfill_waiters: Arc<Mutex<std::collections::HashMap<String, mpsc::UnboundedSender<HistoryConversation>>>>,
    pub media_tx: Option<mpsc::Sender<MediaJob>>,
    pub media_pending: Arc<AtomicUsize>,
    pub media_dropped: Arc<AtomicU64>,
}

impl App {
    /// Stream events into the store until idle (`Once`) or cancelled
    /// (`Follow`). Requires a paired session; never shows pairing UI.
    pub async fn sync(
        &self,
        opts: SyncOptions,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SyncSummary> {
        self.ensure_authed()?;
        self.connect_with_retry().await?;

        if opts.download_media {
            self.start_media_worker();
        }

        let messages_stored = Arc::new(AtomicU64::new(0));
        let ctx = Arc::new(SyncContext {
            store: self.store.clone(),
            session: self.session.clone(),
            activity: self.activity.clone(),
            messages_stored: messages_stored.clone(),
            backfill_waiters: self.backfill_waiters.clone(),
            media_tx: opts.download_media.then(|| self.media.sender()).flatten(),
            media_pending: self.media.pending_counter(),
            media_dropped: self.media.dropped_counter(),
        });
        let handler: EventHandler = {
            let ctx = ctx.clone();
            Arc::new(move |event| handle_event(event, &ctx))
        };

        let wa = self.wa()?;
        let handler_id = wa.add_event_handler(handler);
        self.track_handler(handler_id);

        if opts.refresh_contacts {
            let count = self.refresh_contacts().await?;
            tracing::info!("refreshed {count} contacts");
        }
        if opts.refresh_groups {
            let count = self.refresh_groups().await?;
            tracing::info!("refreshed {count} groups");
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("sync cancelled");
                    break;
                }
                () = self.activity.notified() => {
                    // Event or finished media job; the idle window restarts.
                }
                () = tokio::time::sleep(opts.idle_exit), if opts.mode == SyncMode::Once => {
                    let pending = self.media.pending();
                    if pending == 0 {
                        tracing::debug!("idle for {:?}, exiting", opts.idle_exit);
                        break;
                    }
                    tracing::debug!("idle but {pending} media jobs in flight, staying up");
                }
            }
        }

        wa.remove_event_handler(handler_id);
        self.untrack_handler(handler_id);

        let dropped = self.media.dropped();
        if dropped > 0 {
            tracing::warn!("media queue overflowed, {dropped} jobs dropped (re-sync to retry)");
        }

        Ok(SyncSummary {
            messages_stored: messages_stored.load(Ordering::SeqCst),
        })
    }

    /// Connect, retrying transient failures a few times. Anything else
    /// propagates immediately.
    async fn connect_with_retry(&self) -> Result<()> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=3u32 {
            match self.connect(true, false).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < 3 => {
                    tracing::warn!("connect attempt {attempt} failed ({e}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop returns on success or final error")
    }
}

pub(crate) fn handle_event(event: &WaEvent, ctx: &SyncContext) {
    match event {
        WaEvent::Message(msg) => {
            match store_message(&ctx.store, msg) {
                Ok(true) => {
                    ctx.messages_stored.fetch_add(1, Ordering::SeqCst);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("store message {}/{}: {e}", msg.chat_jid, msg.msg_id),
            }
            if msg.media.is_some() {
                if let Some(tx) = &ctx.media_tx {
                    enqueue_media(tx, &ctx.media_pending, &ctx.media_dropped, msg);
                }
            }
        }
        WaEvent::HistorySync(history) => {
            apply_history_sync(ctx, history);
        }
        WaEvent::Contact(c) => {
            if let Err(e) = ctx.store.upsert_contact(
                &c.jid,
                &c.phone,
                &c.push_name,
                &c.full_name,
                &c.first_name,
                &c.business_name,
            ) {
                tracing::warn!("store contact {}: {e}", c.jid);
            }
        }
        WaEvent::GroupInfo(g) => {
            if let Err(e) = super::bootstrap::persist_group_snapshot(&ctx.store, g) {
                tracing::warn!("store group {}: {e}", g.jid);
            }
        }
        WaEvent::Connected => ctx.session.set(SessionState::Connected),
        WaEvent::Disconnected => ctx.session.set(SessionState::Disconnected),
        WaEvent::LoggedOut => ctx.session.set(SessionState::LoggedOut),
    }
    ctx.activity.notify_one();
}

/// Upsert a message plus its chat and sender rows. Returns whether the
/// message row was new.
pub(crate) fn store_message(store: &Store, msg: &MessageEvent) -> Result<bool> {
    if msg.chat_jid.is_empty() || msg.msg_id.is_empty() {
        return Err(Error::invalid("message event without chat or id"));
    }

    let kind = msg
        .chat_jid
        .parse::<Jid>()
        .map(|j| j.chat_kind())
        .unwrap_or("unknown");
    store.upsert_chat(&msg.chat_jid, kind, "", msg.timestamp)?;

    if !msg.from_me && !msg.sender_jid.is_empty() {
        if let Ok(sender) = msg.sender_jid.parse::<Jid>() {
            store.upsert_contact(
                &msg.sender_jid,
                sender.user(),
                &msg.sender_name,
                "",
                "",
                "",
            )?;
        }
    }

    let media = msg.media.clone().unwrap_or_default();
    store.upsert_message(&UpsertMessageParams {
        chat_jid: msg.chat_jid.clone(),
        msg_id: msg.msg_id.clone(),
        sender_jid: msg.sender_jid.clone(),
        sender_name: msg.sender_name.clone(),
        chat_name: String::new(),
        timestamp: msg.timestamp,
        from_me: msg.from_me,
        text: msg.text.clone(),
        display_text: display_text(msg),
        media_type: media.media_type,
        media_caption: media.caption,
        filename: media.filename,
        mime_type: media.mime_type,
        direct_path: media.direct_path,
        media_key: some_nonempty(media.media_key),
        file_sha256: some_nonempty(media.file_sha256),
        file_enc_sha256: some_nonempty(media.file_enc_sha256),
        file_length: media.file_length,
    })
}

/// Upsert every embedded conversation, then resolve any pending on-demand
/// backfill waiting on one of them.
pub(crate) fn apply_history_sync(ctx: &SyncContext, history: &HistorySyncEvent) {
    for conv in &history.conversations {
        if conv.chat_jid.is_empty() {
            continue;
        }
        let kind = conv
            .chat_jid
            .parse::<Jid>()
            .map(|j| j.chat_kind())
            .unwrap_or("unknown");
        let newest = conv.messages.iter().filter_map(|m| m.timestamp).max();
        if let Err(e) = ctx.store.upsert_chat(&conv.chat_jid, kind, &conv.chat_name, newest) {
            tracing::warn!("store chat {}: {e}", conv.chat_jid);
        }
        for msg in &conv.messages {
            match store_message(&ctx.store, msg) {
                Ok(true) => {
                    ctx.messages_stored.fetch_add(1, Ordering::SeqCst);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("store history message {}: {e}", conv.chat_jid),
            }
        }

        if history.on_demand {
            let waiter = ctx.backfill_waiters.lock().get(&conv.chat_jid).cloned();
            if let Some(tx) = waiter {
                let _ = tx.send(conv.clone());
            }
        }
    }
}

fn enqueue_media(
    tx: &mpsc::Sender<MediaJob>,
    pending: &AtomicUsize,
    dropped: &AtomicU64,
    msg: &MessageEvent,
) {
    let job = MediaJob {
        chat_jid: msg.chat_jid.clone(),
        msg_id: msg.msg_id.clone(),
    };
    pending.fetch_add(1, Ordering::SeqCst);
    if let Err(e) = tx.try_send(job) {
        pending.fetch_sub(1, Ordering::SeqCst);
        dropped.fetch_add(1, Ordering::SeqCst);
        tracing::warn!("media queue full, dropping job for {}/{}: {e}", msg.chat_jid, msg.msg_id);
    }
}

/// The list rendering of a message: its text, else the caption, else a
/// bracketed media tag.
fn display_text(msg: &MessageEvent) -> String {
    if !msg.text.is_empty() {
        return msg.text.clone();
    }
    if let Some(media) = &msg.media {
        if !media.caption.is_empty() {
            return media.caption.clone();
        }
        if !media.media_type.is_empty() {
            return format!("[{}]", media.media_type);
        }
    }
    String::new()
}

fn some_nonempty(bytes: Vec<u8>) -> Option<Vec<u8>> {
    if bytes.is_empty() {
        None
    } else {
        Some(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wa::MediaMeta;
    use chrono::TimeZone;

    fn event(chat: &str, id: &str, ts: i64, text: &str) -> MessageEvent {
        MessageEvent {
            chat_jid: chat.into(),
            msg_id: id.into(),
            sender_jid: chat.into(),
            sender_name: "Alice".into(),
            timestamp: Some(chrono::Utc.timestamp_opt(ts, 0).unwrap()),
            from_me: false,
            text: text.into(),
            media: None,
        }
    }

    #[test]
    fn store_message_fills_chat_and_contact() {
        let store = Store::open_in_memory().unwrap();
        let is_new = store_message(&store, &event("1@s.whatsapp.net", "m1", 1000, "hi")).unwrap();
        assert!(is_new);

        let chat = store.get_chat("1@s.whatsapp.net").unwrap();
        assert_eq!(chat.kind, "dm");
        let contact = store.get_contact("1@s.whatsapp.net").unwrap();
        assert_eq!(contact.name, "Alice");

        // Same event again widens, does not double-count.
        let is_new = store_message(&store, &event("1@s.whatsapp.net", "m1", 1000, "hi")).unwrap();
        assert!(!is_new);
    }

    #[test]
    fn display_text_prefers_text_then_caption_then_tag() {
        let mut msg = event("1@s.whatsapp.net", "m", 1, "words");
        assert_eq!(display_text(&msg), "words");

        msg.text.clear();
        msg.media = Some(MediaMeta {
            media_type: "image".into(),
            caption: "a sunset".into(),
            ..Default::default()
        });
        assert_eq!(display_text(&msg), "a sunset");

        msg.media.as_mut().unwrap().caption.clear();
        assert_eq!(display_text(&msg), "[image]");
    }

    #[test]
    fn group_chat_kind_derived_from_jid() {
        let store = Store::open_in_memory().unwrap();
        store_message(&store, &event("5@g.us", "m1", 1000, "hello group")).unwrap();
        assert_eq!(store.get_chat("5@g.us").unwrap().kind, "group");
    }
}
