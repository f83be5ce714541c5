//! The orchestrator tying store, lock, protocol client and workers together.
//!
//! Lock discipline: `state` guards only cheap bookkeeping (session state,
//! registered handler ids). It is never held across a protocol-client call
//! or a store write — data is copied out and the guard dropped first. Event
//! handlers never touch it at all: they work through the Store (internally
//! locked), atomics, channels and the activity `Notify`.

mod backfill;
mod bootstrap;
mod media;
mod sync;

pub use backfill::{BackfillOptions, BackfillSummary};
pub use media::{MediaDownload, MediaJob};
pub use sync::{SyncMode, SyncOptions, SyncSummary};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::store::Store;
use crate::wa::{HistoryConversation, WaClient};

/// Session lifecycle, driven by protocol events. `LoggedOut` is terminal
/// until the device is re-paired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Authenticated = 2,
    Connected = 3,
    Disconnected = 4,
    LoggedOut = 5,
}

/// Lock-free session-state cell, safe to poke from event handlers.
#[derive(Default)]
pub(crate) struct SessionCell(AtomicU8);

impl SessionCell {
    pub fn set(&self, state: SessionState) {
        // LoggedOut is sticky.
        if self.get() == SessionState::LoggedOut {
            return;
        }
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> SessionState {
        match self.0.load(Ordering::SeqCst) {
            1 => SessionState::Connecting,
            2 => SessionState::Authenticated,
            3 => SessionState::Connected,
            4 => SessionState::Disconnected,
            5 => SessionState::LoggedOut,
            _ => SessionState::Idle,
        }
    }
}

#[derive(Default)]
struct AppState {
    handler_ids: Vec<u64>,
}

pub struct Options {
    pub config: Config,
}

pub struct App {
    config: Config,
    store: Store,
    wa: Mutex<Option<Arc<dyn WaClient>>>,
    state: Mutex<AppState>,
    session: Arc<SessionCell>,
    /// Pinged by event handlers and the media worker; the sync idle detector
    /// waits on it.
    activity: Arc<Notify>,
    media: media::MediaPipeline,
    /// Per-chat resolution channels for in-flight on-demand backfills.
    backfill_waiters: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<HistoryConversation>>>>,
}

impl App {
    /// Open the store under the configured directory. The protocol client is
    /// attached separately ([`App::open_wa`] or [`App::set_client`]).
    pub fn open(options: Options) -> Result<Self> {
        let store = Store::open(&options.config.db_path())?;
        Ok(Self {
            config: options.config,
            store,
            wa: Mutex::new(None),
            state: Mutex::new(AppState::default()),
            session: Arc::new(SessionCell::default()),
            activity: Arc::new(Notify::new()),
            media: media::MediaPipeline::new(),
            backfill_waiters: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session_state(&self) -> SessionState {
        self.session.get()
    }

    /// Attach the wa-rs client backed by `session.db`. No-op when a client
    /// is already attached.
    pub async fn open_wa(&self) -> Result<()> {
        if self.wa.lock().is_some() {
            return Ok(());
        }
        let client = crate::wa::client::WaRs::open(&self.config.session_db_path()).await?;
        let client: Arc<dyn WaClient> = Arc::new(client);
        if client.is_authed() {
            self.session.set(SessionState::Authenticated);
        }
        *self.wa.lock() = Some(client);
        Ok(())
    }

    /// Inject a protocol client. Used by tests and by embedders that provide
    /// their own transport.
    pub fn set_client(&self, client: Arc<dyn WaClient>) {
        if client.is_authed() {
            self.session.set(SessionState::Authenticated);
        }
        *self.wa.lock() = Some(client);
    }

    /// Clone out the client handle; the lock is released before the caller
    /// makes any protocol call through it.
    pub fn wa(&self) -> Result<Arc<dyn WaClient>> {
        self.wa
            .lock()
            .clone()
            .ok_or_else(|| Error::protocol("protocol client not opened"))
    }

    pub fn ensure_authed(&self) -> Result<()> {
        if self.wa()?.is_authed() {
            Ok(())
        } else {
            Err(Error::NotAuthenticated)
        }
    }

    /// Connect the session. `sync` and every other non-pairing path passes
    /// `allow_qr = false` and fails fast when unauthenticated.
    pub async fn connect(&self, wait_for_ready: bool, allow_qr: bool) -> Result<()> {
        let wa = self.wa()?;
        if !wa.is_authed() && !allow_qr {
            return Err(Error::NotAuthenticated);
        }
        self.session.set(SessionState::Connecting);
        match wa.connect(wait_for_ready, allow_qr).await {
            Ok(()) => {
                self.session.set(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.session.set(SessionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Deregister handlers, shut the media worker down after its current
    /// job, and drop the socket. Runs on every exit path.
    pub async fn close(&self) {
        let ids = std::mem::take(&mut self.state.lock().handler_ids);
        if let Ok(wa) = self.wa() {
            for id in ids {
                wa.remove_event_handler(id);
            }
            wa.disconnect().await;
        }
        self.media.shutdown().await;
    }

    /// Record a registration id for cleanup in [`App::close`]. Callers
    /// register with the client first, then hand the id over; the bookkeeping
    /// lock is taken only after the client call returned.
    pub(crate) fn track_handler(&self, id: u64) {
        self.state.lock().handler_ids.push(id);
    }

    pub(crate) fn untrack_handler(&self, id: u64) {
        self.state.lock().handler_ids.retain(|h| *h != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logged_out_is_terminal() {
        let cell = SessionCell::default();
        cell.set(SessionState::Connected);
        assert_eq!(cell.get(), SessionState::Connected);
        cell.set(SessionState::LoggedOut);
        cell.set(SessionState::Connecting);
        assert_eq!(cell.get(), SessionState::LoggedOut);
    }

    #[test]
    fn app_without_client_reports_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::resolve(Some(dir.path().to_str().unwrap()), None);
        let app = App::open(Options { config }).unwrap();
        assert!(app.wa().is_err());
        assert_eq!(app.session_state(), SessionState::Idle);
    }
}
