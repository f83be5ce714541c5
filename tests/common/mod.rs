//! Shared test fixtures: a fully in-process fake protocol client and an App
//! wired to a temp store directory.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use wacli::app::{App, Options};
use wacli::config::Config;
use wacli::errors::{Error, Result};
use wacli::wa::{
    ContactSnapshot, EventHandler, GroupSnapshot, HistoryAnchor, HistorySyncEvent, Jid,
    MediaDownloadRequest, ParticipantAction, WaClient, WaEvent,
};

type OnDemandFn = dyn Fn(&HistoryAnchor, usize) -> HistorySyncEvent + Send + Sync;

/// Fake [`WaClient`]: events are dispatched synchronously to registered
/// handlers, the way the real client fans out from its library task.
#[derive(Default)]
pub struct FakeWa {
    pub authed: AtomicBool,
    handlers: Mutex<HashMap<u64, EventHandler>>,
    next_id: AtomicU64,
    pub contacts: Mutex<Vec<ContactSnapshot>>,
    pub groups: Mutex<Vec<GroupSnapshot>>,
    pub media_payload: Mutex<Vec<u8>>,
    on_demand_history: Mutex<Option<Box<OnDemandFn>>>,
    last_request: Mutex<Option<(HistoryAnchor, usize)>>,
}

impl FakeWa {
    pub fn new() -> Arc<Self> {
        let fake = Self::default();
        fake.authed.store(true, Ordering::SeqCst);
        *fake.media_payload.lock() = vec![1, 2, 3, 4];
        Arc::new(fake)
    }

    pub fn set_on_demand_history<F>(&self, f: F)
    where
        F: Fn(&HistoryAnchor, usize) -> HistorySyncEvent + Send + Sync + 'static,
    {
        *self.on_demand_history.lock() = Some(Box::new(f));
    }

    pub fn emit(&self, event: &WaEvent) {
        let snapshot: Vec<EventHandler> = self.handlers.lock().values().cloned().collect();
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }
}

#[async_trait]
impl WaClient for FakeWa {
    fn is_authed(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }

    async fn connect(&self, _wait_for_ready: bool, allow_qr: bool) -> Result<()> {
        if !self.is_authed() && !allow_qr {
            return Err(Error::NotAuthenticated);
        }
        Ok(())
    }

    async fn disconnect(&self) {}

    fn add_event_handler(&self, handler: EventHandler) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.handlers.lock().insert(id, handler);
        id
    }

    fn remove_event_handler(&self, id: u64) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    async fn get_all_contacts(&self) -> Result<Vec<ContactSnapshot>> {
        Ok(self.contacts.lock().clone())
    }

    async fn get_joined_groups(&self) -> Result<Vec<GroupSnapshot>> {
        Ok(self.groups.lock().clone())
    }

    async fn get_group_info(&self, jid: &Jid) -> Result<GroupSnapshot> {
        self.groups
            .lock()
            .iter()
            .find(|g| g.jid == jid.to_string())
            .cloned()
            .ok_or_else(|| Error::not_found("group"))
    }

    async fn set_group_name(&self, jid: &Jid, name: &str) -> Result<()> {
        for g in self.groups.lock().iter_mut() {
            if g.jid == jid.to_string() {
                g.name = name.to_string();
                return Ok(());
            }
        }
        Err(Error::not_found("group"))
    }

    async fn update_group_participants(
        &self,
        _group: &Jid,
        users: &[Jid],
        _action: ParticipantAction,
    ) -> Result<Vec<String>> {
        Ok(users.iter().map(ToString::to_string).collect())
    }

    async fn leave_group(&self, _jid: &Jid) -> Result<()> {
        Ok(())
    }

    async fn get_group_invite_link(&self, jid: &Jid, revoke: bool) -> Result<String> {
        let tag = if revoke { "fresh" } else { "existing" };
        Ok(format!("https://chat.whatsapp.com/{tag}-{}", jid.user()))
    }

    async fn join_group_with_link(&self, _code: &str) -> Result<Jid> {
        Ok(Jid::new("777", "g.us"))
    }

    async fn download_media_to_file(
        &self,
        _req: &MediaDownloadRequest,
        target: &Path,
    ) -> Result<u64> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = self.media_payload.lock().clone();
        std::fs::write(target, &payload)?;
        Ok(payload.len() as u64)
    }

    fn build_history_sync_request(&self, anchor: &HistoryAnchor, count: usize) -> Result<Vec<u8>> {
        *self.last_request.lock() = Some((anchor.clone(), count));
        Ok(anchor.msg_id.clone().into_bytes())
    }

    async fn send_history_sync_request(&self, _blob: &[u8]) -> Result<()> {
        let request = self.last_request.lock().clone();
        let Some((anchor, count)) = request else {
            return Err(Error::invalid("no request was built"));
        };
        let response = {
            let cb = self.on_demand_history.lock();
            cb.as_ref().map(|f| f(&anchor, count))
        };
        if let Some(event) = response {
            self.emit(&WaEvent::HistorySync(event));
        }
        Ok(())
    }
}

/// App over a fresh temp store with the fake client injected.
pub fn test_app() -> (tempfile::TempDir, Arc<App>, Arc<FakeWa>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let config = Config::resolve(Some(dir.path().to_str().unwrap()), Some(5));
    let app = Arc::new(App::open(Options { config }).expect("open app"));
    let fake = FakeWa::new();
    app.set_client(fake.clone());
    (dir, app, fake)
}
