//! Capability surface over the WhatsApp Web protocol library.
//!
//! The App layer only sees [`WaClient`] and the domain types below, so tests
//! run against in-process fakes and the wa-rs integration stays confined to
//! [`client`] and [`session`]. Event handlers are invoked from library-owned
//! tasks: implementations must tolerate registration and removal at any time,
//! and callers must not hold their own locks across either call.

pub mod client;
pub mod jid;
pub mod session;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{Error, Result};

pub use jid::{parse_user_or_jid, Jid};

/// Callback invoked for every inbound protocol event. Fired from library
/// tasks; keep it non-blocking.
pub type EventHandler = Arc<dyn Fn(&WaEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum WaEvent {
    Message(MessageEvent),
    HistorySync(HistorySyncEvent),
    Contact(ContactSnapshot),
    GroupInfo(GroupSnapshot),
    Connected,
    Disconnected,
    LoggedOut,
}

/// One inbound message, already translated out of protobuf shape.
#[derive(Debug, Clone, Default)]
pub struct MessageEvent {
    pub chat_jid: String,
    pub msg_id: String,
    pub sender_jid: String,
    pub sender_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub from_me: bool,
    pub text: String,
    pub media: Option<MediaMeta>,
}

/// Attachment metadata carried by a message; the decryption tuple plus
/// naming hints.
#[derive(Debug, Clone, Default)]
pub struct MediaMeta {
    pub media_type: String,
    pub caption: String,
    pub filename: String,
    pub mime_type: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
}

/// A history-sync batch: spontaneous after pairing, or the response to an
/// on-demand request.
#[derive(Debug, Clone, Default)]
pub struct HistorySyncEvent {
    pub on_demand: bool,
    pub conversations: Vec<HistoryConversation>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryConversation {
    pub chat_jid: String,
    pub chat_name: String,
    /// Server says no older messages remain for this chat.
    pub end_of_history: bool,
    pub messages: Vec<MessageEvent>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ContactSnapshot {
    pub jid: String,
    pub phone: String,
    pub push_name: String,
    pub full_name: String,
    pub first_name: String,
    pub business_name: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GroupSnapshot {
    pub jid: String,
    pub name: String,
    pub owner_jid: String,
    pub created_at: Option<DateTime<Utc>>,
    pub participants: Vec<ParticipantSnapshot>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ParticipantSnapshot {
    pub jid: String,
    pub is_admin: bool,
    pub is_superadmin: bool,
}

impl ParticipantSnapshot {
    pub fn role(&self) -> &'static str {
        if self.is_superadmin {
            "superadmin"
        } else if self.is_admin {
            "admin"
        } else {
            "member"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

impl ParticipantAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Promote => "promote",
            Self::Demote => "demote",
        }
    }
}

impl FromStr for ParticipantAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "remove" => Ok(Self::Remove),
            "promote" => Ok(Self::Promote),
            "demote" => Ok(Self::Demote),
            other => Err(Error::invalid(format!("unknown participant action {other:?}"))),
        }
    }
}

/// Cursor for on-demand backfill: identity of the oldest known message.
#[derive(Debug, Clone, Default)]
pub struct HistoryAnchor {
    pub chat_jid: String,
    pub msg_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub from_me: bool,
}

/// Everything needed to fetch and decrypt one media blob.
#[derive(Debug, Clone, Default)]
pub struct MediaDownloadRequest {
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
    pub media_type: String,
    pub mime_type: String,
}

/// The protocol client capabilities the App depends on. The production
/// implementation is [`client::WaRs`]; tests substitute fakes.
#[async_trait]
pub trait WaClient: Send + Sync {
    /// Whether a paired session exists (no network involved).
    fn is_authed(&self) -> bool;

    /// Establish the socket. With `wait_for_ready` the call returns only
    /// once the session is usable. Pairing UI (QR / pair code) is shown only
    /// when `allow_qr` is set; `sync` always passes false.
    async fn connect(&self, wait_for_ready: bool, allow_qr: bool) -> Result<()>;

    async fn disconnect(&self);

    fn add_event_handler(&self, handler: EventHandler) -> u64;

    fn remove_event_handler(&self, id: u64) -> bool;

    async fn get_all_contacts(&self) -> Result<Vec<ContactSnapshot>>;

    async fn get_joined_groups(&self) -> Result<Vec<GroupSnapshot>>;

    async fn get_group_info(&self, jid: &Jid) -> Result<GroupSnapshot>;

    async fn set_group_name(&self, jid: &Jid, name: &str) -> Result<()>;

    /// Returns the user JIDs the server acknowledged for the action.
    async fn update_group_participants(
        &self,
        group: &Jid,
        users: &[Jid],
        action: ParticipantAction,
    ) -> Result<Vec<String>>;

    async fn leave_group(&self, jid: &Jid) -> Result<()>;

    async fn get_group_invite_link(&self, jid: &Jid, revoke: bool) -> Result<String>;

    async fn join_group_with_link(&self, code: &str) -> Result<Jid>;

    /// Fetch, decrypt and write one attachment; returns bytes written.
    async fn download_media_to_file(
        &self,
        req: &MediaDownloadRequest,
        target: &Path,
    ) -> Result<u64>;

    /// Build the opaque on-demand history request blob anchored at the
    /// oldest known message.
    fn build_history_sync_request(&self, anchor: &HistoryAnchor, count: usize) -> Result<Vec<u8>>;

    /// Fire a previously built request; the response arrives later as a
    /// [`WaEvent::HistorySync`] with `on_demand` set.
    async fn send_history_sync_request(&self, blob: &[u8]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_roles_collapse_correctly() {
        let member = ParticipantSnapshot::default();
        assert_eq!(member.role(), "member");
        let admin = ParticipantSnapshot {
            is_admin: true,
            ..Default::default()
        };
        assert_eq!(admin.role(), "admin");
        let superadmin = ParticipantSnapshot {
            is_admin: true,
            is_superadmin: true,
            ..Default::default()
        };
        assert_eq!(superadmin.role(), "superadmin");
    }

    #[test]
    fn action_round_trips_through_str() {
        for action in [
            ParticipantAction::Add,
            ParticipantAction::Remove,
            ParticipantAction::Promote,
            ParticipantAction::Demote,
        ] {
            assert_eq!(action.as_str().parse::<ParticipantAction>().unwrap(), action);
        }
        assert!("ban".parse::<ParticipantAction>().is_err());
    }
}
