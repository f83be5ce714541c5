//! wa-rs adapter: the production [`WaClient`] implementation.
//!
//! Everything wa-rs-specific lives here and in [`super::session`]. Events are
//! translated into crate-owned domain types before they reach any handler, so
//! the App layer and its tests never see protobuf shapes. The handler
//! registry is fanned out from the single `on_event` closure the bot builder
//! accepts; the registry lock is released before any handler runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prost::Message as _;
use tokio::sync::watch;

use wa_rs::bot::Bot;
use wa_rs::store::Device;
use wa_rs_core::store::traits::DeviceStore as _;
use wa_rs_core::types::events::Event;
use wa_rs_proto::whatsapp as proto;
use wa_rs_tokio_transport::TokioWebSocketTransportFactory;
use wa_rs_ureq_http::UreqHttpClient;

use super::session::SessionStore;
use super::{
    ContactSnapshot, EventHandler, GroupSnapshot, HistoryAnchor, HistoryConversation,
    HistorySyncEvent, Jid, MediaDownloadRequest, MediaMeta, MessageEvent, ParticipantAction,
    ParticipantSnapshot, WaClient, WaEvent,
};
use crate::config::CONNECT_TIMEOUT;
use crate::errors::{Error, Result};

pub struct WaRs {
    session: Arc<SessionStore>,
    authed: AtomicBool,
    client: Mutex<Option<Arc<wa_rs::Client>>>,
    bot_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    handlers: Arc<Mutex<HashMap<u64, EventHandler>>>,
    next_handler_id: AtomicU64,
    ready: Mutex<Option<watch::Receiver<bool>>>,
}

impl WaRs {
    /// Open the session backend and probe for a paired device.
    pub async fn open(session_db: &Path) -> Result<Self> {
        let session = Arc::new(SessionStore::open(session_db)?);
        let authed = session
            .exists()
            .await
            .map_err(|e| Error::protocol(format!("probe session store: {e}")))?;
        Ok(Self {
            session,
            authed: AtomicBool::new(authed),
            client: Mutex::new(None),
            bot_task: Mutex::new(None),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            next_handler_id: AtomicU64::new(1),
            ready: Mutex::new(None),
        })
    }

    fn client_handle(&self) -> Result<Arc<wa_rs::Client>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| Error::protocol("not connected"))
    }

    /// Snapshot-then-invoke so no handler ever runs under the registry lock.
    fn dispatch(handlers: &Mutex<HashMap<u64, EventHandler>>, event: &WaEvent) {
        let snapshot: Vec<EventHandler> = handlers.lock().values().cloned().collect();
        for handler in snapshot {
            handler(event);
        }
    }
}

#[async_trait::async_trait]
impl WaClient for WaRs {
    fn is_authed(&self) -> bool {
        self.authed.load(Ordering::SeqCst)
    }

    async fn connect(&self, wait_for_ready: bool, allow_qr: bool) -> Result<()> {
        if self.client.lock().is_some() {
            return Ok(());
        }
        if !self.is_authed() && !allow_qr {
            return Err(Error::NotAuthenticated);
        }

        let backend = self.session.clone();
        let mut device = Device::new(backend.clone());
        if backend
            .exists()
            .await
            .map_err(|e| Error::protocol(e.to_string()))?
        {
            let core_device = backend
                .load()
                .await
                .map_err(|e| Error::protocol(e.to_string()))?
                .ok_or_else(|| Error::protocol("device row exists but failed to load"))?;
            device.load_from_serializable(core_device);
        }

        let mut transport_factory = TokioWebSocketTransportFactory::new();
        if let Ok(ws_url) = std::env::var("WACLI_WS_URL") {
            transport_factory = transport_factory.with_url(ws_url);
        }

        let (ready_tx, ready_rx) = watch::channel(false);
        let handlers = self.handlers.clone();

        let builder = Bot::builder()
            .with_backend(backend)
            .with_transport_factory(transport_factory)
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let handlers = handlers.clone();
                let ready_tx = ready_tx.clone();
                async move {
                    match translate_event(&event, allow_qr) {
                        Some(WaEvent::Connected) => {
                            let _ = ready_tx.send(true);
                            Self::dispatch(&handlers, &WaEvent::Connected);
                        }
                        Some(domain) => Self::dispatch(&handlers, &domain),
                        None => {}
                    }
                }
            });

        let mut bot = builder
            .build()
            .await
            .map_err(|e| Error::transient(format!("build session: {e}")))?;
        *self.client.lock() = Some(bot.client());

        let task = bot
            .run()
            .await
            .map_err(|e| Error::transient(format!("start socket: {e}")))?;
        *self.bot_task.lock() = Some(task);
        *self.ready.lock() = Some(ready_rx.clone());

        if wait_for_ready {
            let mut rx = ready_rx;
            let waited = tokio::time::timeout(CONNECT_TIMEOUT, rx.wait_for(|ready| *ready)).await;
            match waited {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => {
                    self.disconnect().await;
                    return Err(Error::transient("timed out waiting for socket ready"));
                }
            }
        }

        self.authed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        *self.client.lock() = None;
        if let Some(task) = self.bot_task.lock().take() {
            task.abort();
        }
        *self.ready.lock() = None;
    }

    fn add_event_handler(&self, handler: EventHandler) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers.lock().insert(id, handler);
        id
    }

    fn remove_event_handler(&self, id: u64) -> bool {
        self.handlers.lock().remove(&id).is_some()
    }

    async fn get_all_contacts(&self) -> Result<Vec<ContactSnapshot>> {
        let client = self.client_handle()?;
        let contacts = client
            .get_all_contacts()
            .await
            .map_err(|e| Error::protocol(format!("get contacts: {e}")))?;
        Ok(contacts
            .into_iter()
            .map(|(jid, info)| ContactSnapshot {
                jid: jid.to_string(),
                phone: jid.user().to_string(),
                push_name: info.push_name,
                full_name: info.full_name,
                first_name: info.first_name,
                business_name: info.business_name,
            })
            .collect())
    }

    async fn get_joined_groups(&self) -> Result<Vec<GroupSnapshot>> {
        let client = self.client_handle()?;
        let groups = client
            .get_joined_groups()
            .await
            .map_err(|e| Error::protocol(format!("get joined groups: {e}")))?;
        Ok(groups.iter().map(translate_group).collect())
    }

    async fn get_group_info(&self, jid: &Jid) -> Result<GroupSnapshot> {
        let client = self.client_handle()?;
        let wire = wire_jid(jid)?;
        let info = client
            .get_group_info(&wire)
            .await
            .map_err(|e| Error::protocol(format!("get group info: {e}")))?;
        Ok(translate_group(&info))
    }

    async fn set_group_name(&self, jid: &Jid, name: &str) -> Result<()> {
        let client = self.client_handle()?;
        client
            .set_group_name(&wire_jid(jid)?, name.to_string())
            .await
            .map_err(|e| Error::protocol(format!("set group name: {e}")))
    }

    async fn update_group_participants(
        &self,
        group: &Jid,
        users: &[Jid],
        action: ParticipantAction,
    ) -> Result<Vec<String>> {
        let client = self.client_handle()?;
        let wire_users = users
            .iter()
            .map(wire_jid)
            .collect::<Result<Vec<_>>>()?;
        let change = match action {
            ParticipantAction::Add => wa_rs_core::types::ParticipantChange::Add,
            ParticipantAction::Remove => wa_rs_core::types::ParticipantChange::Remove,
            ParticipantAction::Promote => wa_rs_core::types::ParticipantChange::Promote,
            ParticipantAction::Demote => wa_rs_core::types::ParticipantChange::Demote,
        };
        let updated = client
            .update_group_participants(&wire_jid(group)?, &wire_users, change)
            .await
            .map_err(|e| Error::protocol(format!("{} participants: {e}", action.as_str())))?;
        Ok(updated.into_iter().map(|p| p.jid.to_string()).collect())
    }

    async fn leave_group(&self, jid: &Jid) -> Result<()> {
        let client = self.client_handle()?;
        client
            .leave_group(&wire_jid(jid)?)
            .await
            .map_err(|e| Error::protocol(format!("leave group: {e}")))
    }

    async fn get_group_invite_link(&self, jid: &Jid, revoke: bool) -> Result<String> {
        let client = self.client_handle()?;
        client
            .get_group_invite_link(&wire_jid(jid)?, revoke)
            .await
            .map_err(|e| Error::protocol(format!("invite link: {e}")))
    }

    async fn join_group_with_link(&self, code: &str) -> Result<Jid> {
        let client = self.client_handle()?;
        let joined = client
            .join_group_with_link(code)
            .await
            .map_err(|e| Error::protocol(format!("join group: {e}")))?;
        joined.to_string().parse()
    }

    async fn download_media_to_file(
        &self,
        req: &MediaDownloadRequest,
        target: &Path,
    ) -> Result<u64> {
        let client = self.client_handle()?;
        let media_type = wire_media_type(&req.media_type)?;
        let data = client
            .download_media(wa_rs_core::download::DownloadRequest {
                direct_path: req.direct_path.clone(),
                media_key: req.media_key.clone(),
                file_enc_sha256: req.file_enc_sha256.clone(),
                file_sha256: req.file_sha256.clone(),
                file_length: req.file_length,
                media_type,
                mime_type: req.mime_type.clone(),
            })
            .await
            .map_err(|e| Error::transient(format!("download media: {e}")))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &data).await?;
        Ok(data.len() as u64)
    }

    fn build_history_sync_request(&self, anchor: &HistoryAnchor, count: usize) -> Result<Vec<u8>> {
        let request = proto::message::PeerDataOperationRequestMessage {
            peer_data_operation_request_type: Some(
                proto::message::peer_data_operation_request_message::PeerDataOperationRequestType::HistorySyncOnDemand
                    as i32,
            ),
            history_sync_on_demand_request: Some(
                proto::message::peer_data_operation_request_message::HistorySyncOnDemandRequest {
                    chat_jid: Some(anchor.chat_jid.clone()),
                    oldest_msg_id: Some(anchor.msg_id.clone()),
                    oldest_msg_from_me: Some(anchor.from_me),
                    on_demand_msg_count: Some(count as i32),
                    oldest_msg_timestamp_ms: anchor.timestamp.map(|t| t.timestamp_millis()),
                },
            ),
            ..Default::default()
        };
        let msg = proto::Message {
            protocol_message: Some(Box::new(proto::message::ProtocolMessage {
                r#type: Some(
                    proto::message::protocol_message::Type::PeerDataOperationRequestMessage as i32,
                ),
                peer_data_operation_request_message: Some(request),
                ..Default::default()
            })),
            ..Default::default()
        };
        Ok(msg.encode_to_vec())
    }

    async fn send_history_sync_request(&self, blob: &[u8]) -> Result<()> {
        let client = self.client_handle()?;
        let msg = proto::Message::decode(blob)
            .map_err(|e| Error::invalid(format!("malformed history request blob: {e}")))?;
        client
            .send_peer_message(msg)
            .await
            .map_err(|e| Error::transient(format!("send history request: {e}")))?;
        Ok(())
    }
}

fn wire_jid(jid: &Jid) -> Result<wa_rs_binary::jid::Jid> {
    jid.to_string()
        .parse()
        .map_err(|e| Error::invalid(format!("invalid JID {jid}: {e}")))
}

fn wire_media_type(tag: &str) -> Result<wa_rs_core::download::MediaType> {
    use wa_rs_core::download::MediaType;
    match tag {
        "image" => Ok(MediaType::Image),
        "video" => Ok(MediaType::Video),
        "audio" => Ok(MediaType::Audio),
        "document" => Ok(MediaType::Document),
        "sticker" => Ok(MediaType::Sticker),
        other => Err(Error::invalid(format!("unsupported media type {other:?}"))),
    }
}

fn translate_event(event: &Event, allow_qr: bool) -> Option<WaEvent> {
    match event {
        Event::Message(msg, info) => Some(WaEvent::Message(translate_live_message(msg, info))),
        Event::HistorySync(data) => Some(WaEvent::HistorySync(translate_history_sync(data))),
        Event::Contact(contact) => Some(WaEvent::Contact(ContactSnapshot {
            jid: contact.jid.to_string(),
            phone: contact.jid.user().to_string(),
            push_name: contact.push_name.clone().unwrap_or_default(),
            full_name: contact.full_name.clone().unwrap_or_default(),
            first_name: contact.first_name.clone().unwrap_or_default(),
            business_name: contact.business_name.clone().unwrap_or_default(),
        })),
        Event::GroupInfo(group) => Some(WaEvent::GroupInfo(translate_group(group))),
        Event::Connected(_) => Some(WaEvent::Connected),
        Event::Disconnected(_) => Some(WaEvent::Disconnected),
        Event::LoggedOut(_) => {
            tracing::warn!("session was logged out on the phone");
            Some(WaEvent::LoggedOut)
        }
        Event::PairingQrCode { code, .. } => {
            if allow_qr {
                tracing::info!("scan this QR code in WhatsApp > Linked Devices: {code}");
            }
            None
        }
        Event::PairingCode { code, .. } => {
            if allow_qr {
                tracing::info!("enter this pair code in WhatsApp > Linked Devices: {code}");
            }
            None
        }
        Event::StreamError(err) => {
            tracing::error!("stream error: {err:?}");
            None
        }
        _ => None,
    }
}

fn translate_live_message(
    msg: &proto::Message,
    info: &wa_rs_core::types::MessageInfo,
) -> MessageEvent {
    use wa_rs_core::proto_helpers::MessageExt as _;

    MessageEvent {
        chat_jid: info.source.chat.to_string(),
        msg_id: info.id.clone(),
        sender_jid: info.source.sender.to_string(),
        sender_name: info.push_name.clone(),
        timestamp: Some(info.timestamp),
        from_me: info.source.from_me,
        text: msg.text_content().unwrap_or("").to_string(),
        media: extract_media(msg),
    }
}

/// Pull the decryption tuple out of whichever media slot is populated.
fn extract_media(msg: &proto::Message) -> Option<MediaMeta> {
    if let Some(m) = msg.image_message.as_deref() {
        return Some(media_meta(
            "image",
            m.caption.clone(),
            None,
            &m.mimetype,
            &m.direct_path,
            &m.media_key,
            &m.file_sha256,
            &m.file_enc_sha256,
            m.file_length,
        ));
    }
    if let Some(m) = msg.video_message.as_deref() {
        return Some(media_meta(
            "video",
            m.caption.clone(),
            None,
            &m.mimetype,
            &m.direct_path,
            &m.media_key,
            &m.file_sha256,
            &m.file_enc_sha256,
            m.file_length,
        ));
    }
    if let Some(m) = msg.audio_message.as_deref() {
        return Some(media_meta(
            "audio",
            None,
            None,
            &m.mimetype,
            &m.direct_path,
            &m.media_key,
            &m.file_sha256,
            &m.file_enc_sha256,
            m.file_length,
        ));
    }
    if let Some(m) = msg.document_message.as_deref() {
        return Some(media_meta(
            "document",
            m.caption.clone(),
            m.file_name.clone(),
            &m.mimetype,
            &m.direct_path,
            &m.media_key,
            &m.file_sha256,
            &m.file_enc_sha256,
            m.file_length,
        ));
    }
    if let Some(m) = msg.sticker_message.as_deref() {
        return Some(media_meta(
            "sticker",
            None,
            None,
            &m.mimetype,
            &m.direct_path,
            &m.media_key,
            &m.file_sha256,
            &m.file_enc_sha256,
            m.file_length,
        ));
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn media_meta(
    media_type: &str,
    caption: Option<String>,
    filename: Option<String>,
    mime: &Option<String>,
    direct_path: &Option<String>,
    media_key: &Option<Vec<u8>>,
    file_sha256: &Option<Vec<u8>>,
    file_enc_sha256: &Option<Vec<u8>>,
    file_length: Option<u64>,
) -> MediaMeta {
    MediaMeta {
        media_type: media_type.to_string(),
        caption: caption.unwrap_or_default(),
        filename: filename.unwrap_or_default(),
        mime_type: mime.clone().unwrap_or_default(),
        direct_path: direct_path.clone().unwrap_or_default(),
        media_key: media_key.clone().unwrap_or_default(),
        file_sha256: file_sha256.clone().unwrap_or_default(),
        file_enc_sha256: file_enc_sha256.clone().unwrap_or_default(),
        file_length: file_length.unwrap_or_default(),
    }
}

fn translate_history_sync(data: &wa_rs_core::types::events::HistorySync) -> HistorySyncEvent {
    let sync = &data.data;
    let on_demand = sync.sync_type == Some(proto::history_sync::HistorySyncType::OnDemand as i32);
    let conversations = sync
        .conversations
        .iter()
        .map(|conv| HistoryConversation {
            chat_jid: conv.id.clone().unwrap_or_default(),
            chat_name: conv.name.clone().unwrap_or_default(),
            end_of_history: conv.end_of_history_transfer.unwrap_or(false),
            messages: conv
                .messages
                .iter()
                .filter_map(|m| m.message.as_ref())
                .map(translate_history_message)
                .collect(),
        })
        .collect();
    HistorySyncEvent {
        on_demand,
        conversations,
    }
}

fn translate_history_message(web_msg: &proto::WebMessageInfo) -> MessageEvent {
    use wa_rs_core::proto_helpers::MessageExt as _;

    let key = web_msg.key.as_ref();
    let chat_jid = key
        .and_then(|k| k.remote_jid.clone())
        .unwrap_or_default();
    let from_me = key.and_then(|k| k.from_me).unwrap_or(false);
    let sender_jid = key
        .and_then(|k| k.participant.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| chat_jid.clone());

    MessageEvent {
        chat_jid,
        msg_id: key.and_then(|k| k.id.clone()).unwrap_or_default(),
        sender_jid,
        sender_name: web_msg.push_name.clone().unwrap_or_default(),
        timestamp: web_msg
            .message_timestamp
            .and_then(|secs| chrono::DateTime::from_timestamp(secs as i64, 0)),
        from_me,
        text: web_msg
            .message
            .as_ref()
            .and_then(|m| m.text_content())
            .unwrap_or("")
            .to_string(),
        media: web_msg.message.as_ref().and_then(|m| extract_media(m)),
    }
}

fn translate_group(info: &wa_rs_core::types::GroupInfo) -> GroupSnapshot {
    GroupSnapshot {
        jid: info.jid.to_string(),
        name: info.name.clone(),
        owner_jid: info
            .owner_jid
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default(),
        created_at: info.created_at,
        participants: info
            .participants
            .iter()
            .map(|p| ParticipantSnapshot {
                jid: p.jid.to_string(),
                is_admin: p.is_admin,
                is_superadmin: p.is_super_admin,
            })
            .collect(),
    }
}
