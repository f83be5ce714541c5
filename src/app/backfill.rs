//! On-demand history backfill: an RPC built from "send request" plus
//! "receive event". The library offers no correlation, so each in-flight
//! backfill parks an unbounded channel keyed by chat jid; the shared
//! history-sync handler resolves it when a matching response lands.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;

use super::sync::{apply_history_sync, SyncContext};
use super::App;
use crate::errors::{Error, Result};
use crate::wa::{EventHandler, HistoryAnchor, WaEvent};

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub chat_jid: String,
    /// Messages requested per hop.
    pub count: usize,
    /// Maximum number of request/response hops.
    pub requests: usize,
    /// Deadline for each individual response.
    pub wait_per_request: Duration,
    /// Overall progress deadline: give up after this much silence.
    pub idle_exit: Duration,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            chat_jid: String::new(),
            count: 50,
            requests: 1,
            wait_per_request: Duration::from_secs(30),
            idle_exit: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub requests_sent: usize,
    pub messages_added: u64,
    pub reached_end: bool,
}

impl App {
    /// Walk a chat's history backwards from the oldest known message.
    pub async fn backfill_history(&self, opts: BackfillOptions) -> Result<BackfillSummary> {
        let chat = opts.chat_jid.trim().to_string();
        if chat.is_empty() {
            return Err(Error::invalid("--chat is required"));
        }
        self.ensure_authed()?;
        self.connect(true, false).await?;

        let messages_added = Arc::new(AtomicU64::new(0));
        let ctx = Arc::new(SyncContext {
            store: self.store.clone(),
            session: self.session.clone(),
            activity: self.activity.clone(),
            messages_stored: messages_added.clone(),
            backfill_waiters: self.backfill_waiters.clone(),
            media_tx: None,
            media_pending: Arc::new(AtomicUsize::new(0)),
            media_dropped: Arc::new(AtomicU64::new(0)),
        });
        let handler: EventHandler = {
            let ctx = ctx.clone();
            Arc::new(move |event| {
                if let WaEvent::HistorySync(history) = event {
                    apply_history_sync(&ctx, history);
                }
            })
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.backfill_waiters.lock().insert(chat.clone(), tx);

        let wa = self.wa()?;
        let handler_id = wa.add_event_handler(handler);
        self.track_handler(handler_id);

        let mut summary = BackfillSummary {
            requests_sent: 0,
            messages_added: 0,
            reached_end: false,
        };
        let mut anchor = self.backfill_anchor(&chat)?;
        let mut last_progress = Instant::now();

        'requests: for _ in 0..opts.requests {
            let blob = wa.build_history_sync_request(&anchor, opts.count)?;
            match wa.send_history_sync_request(&blob).await {
                Ok(()) => summary.requests_sent += 1,
                // Transient sends are tolerated inside the loop; the idle cap
                // still bounds total stall time.
                Err(e) if e.is_transient() => {
                    tracing::warn!("history request not sent: {e}");
                    if last_progress.elapsed() >= opts.idle_exit {
                        break 'requests;
                    }
                    continue;
                }
                Err(e) => {
                    self.backfill_waiters.lock().remove(&chat);
                    wa.remove_event_handler(handler_id);
                    self.untrack_handler(handler_id);
                    return Err(e);
                }
            }

            match tokio::time::timeout(opts.wait_per_request, rx.recv()).await {
                Ok(Some(conv)) => {
                    last_progress = Instant::now();
                    if conv.end_of_history {
                        summary.reached_end = true;
                        break;
                    }
                    // The handler already stored the batch; re-anchor at the
                    // new oldest message.
                    anchor = self.backfill_anchor(&chat)?;
                }
                Ok(None) => break,
                Err(_) => {
                    tracing::debug!("no history response within {:?}", opts.wait_per_request);
                    if last_progress.elapsed() >= opts.idle_exit {
                        tracing::info!("backfill idle for {:?}, giving up", opts.idle_exit);
                        break;
                    }
                }
            }
        }

        self.backfill_waiters.lock().remove(&chat);
        wa.remove_event_handler(handler_id);
        self.untrack_handler(handler_id);

        summary.messages_added = messages_added.load(Ordering::SeqCst);
        Ok(summary)
    }

    /// Oldest known message as the request anchor; a chat with no local
    /// history anchors at the current time.
    fn backfill_anchor(&self, chat: &str) -> Result<HistoryAnchor> {
        match self.store.get_oldest_message_info(chat) {
            Ok(info) => Ok(HistoryAnchor {
                chat_jid: info.chat_jid,
                msg_id: info.msg_id,
                timestamp: info.timestamp,
                from_me: info.from_me,
            }),
            Err(Error::NotFound(_)) => Ok(HistoryAnchor {
                chat_jid: chat.to_string(),
                msg_id: String::new(),
                timestamp: Some(chrono::Utc::now()),
                from_me: false,
            }),
            Err(e) => Err(e),
        }
    }
}
