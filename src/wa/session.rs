//! rusqlite backend for wa-rs's session storage traits.
//!
//! `session.db` holds the protocol library's own state: Signal key material,
//! app-state sync bookkeeping and the paired device record. The rest of wacli
//! treats this file as opaque; only the wa-rs client reads through these
//! traits. Layout note: identities, Signal sessions and sender keys share one
//! `signal_records` table keyed by kind, since wa-rs addresses all three the
//! same way (address → record blob).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message as _;
use rusqlite::{params, Connection, OptionalExtension};

use wa_rs_binary::jid::Jid as WireJid;
use wa_rs_core::appstate::hash::HashState;
use wa_rs_core::appstate::processor::AppStateMutationMAC;
use wa_rs_core::store::error::{Result as StoreResult, StoreError};
use wa_rs_core::store::traits::{
    AppStateSyncKey, AppSyncStore, DeviceInfo, DeviceListRecord, DeviceStore, LidPnMappingEntry,
    SignalStore, TcTokenEntry,
};
use wa_rs_core::store::Device as CoreDevice;

const DEVICE_ID: i32 = 1;

const KIND_IDENTITY: &str = "identity";
const KIND_SESSION: &str = "session";
const KIND_SENDER_KEY: &str = "sender_key";

const SESSION_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS device (
        id INTEGER PRIMARY KEY,
        lid TEXT,
        pn TEXT,
        registration_id INTEGER NOT NULL,
        noise_key BLOB NOT NULL,
        identity_key BLOB NOT NULL,
        signed_pre_key BLOB NOT NULL,
        signed_pre_key_id INTEGER NOT NULL,
        signed_pre_key_signature BLOB NOT NULL,
        adv_secret_key BLOB NOT NULL,
        account BLOB,
        push_name TEXT NOT NULL DEFAULT '',
        app_version_primary INTEGER NOT NULL DEFAULT 0,
        app_version_secondary INTEGER NOT NULL DEFAULT 0,
        app_version_tertiary INTEGER NOT NULL DEFAULT 0,
        app_version_last_fetched_ms INTEGER NOT NULL DEFAULT 0,
        edge_routing_info BLOB,
        props_hash TEXT
    );

    CREATE TABLE IF NOT EXISTS signal_records (
        kind    TEXT NOT NULL,
        address TEXT NOT NULL,
        record  BLOB NOT NULL,
        PRIMARY KEY (kind, address)
    );

    CREATE TABLE IF NOT EXISTS prekeys (
        id       INTEGER PRIMARY KEY,
        record   BLOB NOT NULL,
        uploaded INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS signed_prekeys (
        id     INTEGER PRIMARY KEY,
        record BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS app_state_keys (
        key_id   BLOB PRIMARY KEY,
        key_data BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS app_state_versions (
        name       TEXT PRIMARY KEY,
        state_data BLOB NOT NULL
    );

    CREATE TABLE IF NOT EXISTS app_state_mutation_macs (
        name      TEXT NOT NULL,
        version   INTEGER NOT NULL,
        index_mac BLOB NOT NULL,
        value_mac BLOB NOT NULL,
        PRIMARY KEY (name, index_mac)
    );

    CREATE TABLE IF NOT EXISTS skdm_recipients (
        group_jid  TEXT NOT NULL,
        device_jid TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (group_jid, device_jid)
    );

    CREATE TABLE IF NOT EXISTS lid_pn_mapping (
        lid             TEXT PRIMARY KEY,
        phone_number    TEXT NOT NULL,
        created_at      INTEGER NOT NULL,
        learning_source TEXT NOT NULL,
        updated_at      INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_lid_pn_phone ON lid_pn_mapping(phone_number, updated_at DESC);

    CREATE TABLE IF NOT EXISTS base_keys (
        address    TEXT NOT NULL,
        message_id TEXT NOT NULL,
        base_key   BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (address, message_id)
    );

    CREATE TABLE IF NOT EXISTS device_registry (
        user_id      TEXT PRIMARY KEY,
        devices_json TEXT NOT NULL,
        timestamp    INTEGER NOT NULL,
        phash        TEXT,
        updated_at   INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sender_key_status (
        group_jid   TEXT NOT NULL,
        participant TEXT NOT NULL,
        marked_at   INTEGER NOT NULL,
        PRIMARY KEY (group_jid, participant)
    );

    CREATE TABLE IF NOT EXISTS tc_tokens (
        jid              TEXT PRIMARY KEY,
        token            BLOB NOT NULL,
        token_timestamp  INTEGER NOT NULL,
        sender_timestamp INTEGER,
        updated_at       INTEGER NOT NULL
    );
";

/// Session storage backing the wa-rs client, one paired device per file.
#[derive(Clone)]
pub struct SessionStore {
    db_path: String,
    conn: Arc<Mutex<Connection>>,
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

impl SessionStore {
    pub fn open(path: &Path) -> crate::errors::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = NORMAL;",
        )?;
        conn.execute_batch(SESSION_SCHEMA)?;
        Ok(Self {
            db_path: path.to_string_lossy().into_owned(),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn put_record(&self, kind: &str, address: &str, record: &[u8]) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO signal_records (kind, address, record) VALUES (?1, ?2, ?3)",
                params![kind, address, record],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    fn get_record(&self, kind: &str, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.conn
            .lock()
            .query_row(
                "SELECT record FROM signal_records WHERE kind = ?1 AND address = ?2",
                params![kind, address],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    fn delete_record(&self, kind: &str, address: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM signal_records WHERE kind = ?1 AND address = ?2",
                params![kind, address],
            )
            .map(|_| ())
            .map_err(db_err)
    }
}

#[async_trait]
impl SignalStore for SessionStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> StoreResult<()> {
        self.put_record(KIND_IDENTITY, address, &key)
    }

    async fn load_identity(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_record(KIND_IDENTITY, address)
    }

    async fn delete_identity(&self, address: &str) -> StoreResult<()> {
        self.delete_record(KIND_IDENTITY, address)
    }

    async fn get_session(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_record(KIND_SESSION, address)
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> StoreResult<()> {
        self.put_record(KIND_SESSION, address, session)
    }

    async fn delete_session(&self, address: &str) -> StoreResult<()> {
        self.delete_record(KIND_SESSION, address)
    }

    async fn store_prekey(&self, id: u32, record: &[u8], uploaded: bool) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO prekeys (id, record, uploaded) VALUES (?1, ?2, ?3)",
                params![id, record, uploaded],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn load_prekey(&self, id: u32) -> StoreResult<Option<Vec<u8>>> {
        self.conn
            .lock()
            .query_row("SELECT record FROM prekeys WHERE id = ?1", params![id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)
    }

    async fn remove_prekey(&self, id: u32) -> StoreResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM prekeys WHERE id = ?1", params![id])
            .map(|_| ())
            .map_err(db_err)
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO signed_prekeys (id, record) VALUES (?1, ?2)",
                params![id, record],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn load_signed_prekey(&self, id: u32) -> StoreResult<Option<Vec<u8>>> {
        self.conn
            .lock()
            .query_row(
                "SELECT record FROM signed_prekeys WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    async fn load_all_signed_prekeys(&self) -> StoreResult<Vec<(u32, Vec<u8>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, record FROM signed_prekeys ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn remove_signed_prekey(&self, id: u32) -> StoreResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM signed_prekeys WHERE id = ?1", params![id])
            .map(|_| ())
            .map_err(db_err)
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> StoreResult<()> {
        self.put_record(KIND_SENDER_KEY, address, record)
    }

    async fn get_sender_key(&self, address: &str) -> StoreResult<Option<Vec<u8>>> {
        self.get_record(KIND_SENDER_KEY, address)
    }

    async fn delete_sender_key(&self, address: &str) -> StoreResult<()> {
        self.delete_record(KIND_SENDER_KEY, address)
    }
}

#[async_trait]
impl AppSyncStore for SessionStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> StoreResult<Option<AppStateSyncKey>> {
        let data: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT key_data FROM app_state_keys WHERE key_id = ?1",
                params![key_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        data.map(|bytes| serde_json::from_slice(&bytes).map_err(db_err))
            .transpose()
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> StoreResult<()> {
        let data = serde_json::to_vec(&key).map_err(db_err)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO app_state_keys (key_id, key_data) VALUES (?1, ?2)",
                params![key_id, data],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn get_version(&self, name: &str) -> StoreResult<HashState> {
        let data: Vec<u8> = self
            .conn
            .lock()
            .query_row(
                "SELECT state_data FROM app_state_versions WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        serde_json::from_slice(&data).map_err(db_err)
    }

    async fn set_version(&self, name: &str, state: HashState) -> StoreResult<()> {
        let data = serde_json::to_vec(&state).map_err(db_err)?;
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO app_state_versions (name, state_data) VALUES (?1, ?2)",
                params![name, data],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT OR REPLACE INTO app_state_mutation_macs
                     (name, version, index_mac, value_mac) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db_err)?;
            let version = i64::try_from(version).unwrap_or(i64::MAX);
            for m in mutations {
                stmt.execute(params![name, version, m.index_mac, m.value_mac])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.conn
            .lock()
            .query_row(
                "SELECT value_mac FROM app_state_mutation_macs WHERE name = ?1 AND index_mac = ?2",
                params![name, index_mac],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare("DELETE FROM app_state_mutation_macs WHERE name = ?1 AND index_mac = ?2")
                .map_err(db_err)?;
            for mac in index_macs {
                stmt.execute(params![name, mac]).map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)
    }
}

#[async_trait]
impl wa_rs_core::store::traits::ProtocolStore for SessionStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> StoreResult<Vec<WireJid>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT device_jid FROM skdm_recipients WHERE group_jid = ?1")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![group_jid], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(jid) = row.map_err(db_err)?.parse() {
                out.push(jid);
            }
        }
        Ok(out)
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[WireJid]) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        for jid in device_jids {
            conn.execute(
                "INSERT OR IGNORE INTO skdm_recipients (group_jid, device_jid, created_at)
                 VALUES (?1, ?2, ?3)",
                params![group_jid, jid.to_string(), now],
            )
            .map_err(db_err)?;
        }
        Ok(())
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM skdm_recipients WHERE group_jid = ?1",
                params![group_jid],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn get_lid_mapping(&self, lid: &str) -> StoreResult<Option<LidPnMappingEntry>> {
        self.conn
            .lock()
            .query_row(
                "SELECT lid, phone_number, created_at, learning_source, updated_at
                 FROM lid_pn_mapping WHERE lid = ?1",
                params![lid],
                scan_lid_mapping,
            )
            .optional()
            .map_err(db_err)
    }

    async fn get_pn_mapping(&self, phone: &str) -> StoreResult<Option<LidPnMappingEntry>> {
        self.conn
            .lock()
            .query_row(
                "SELECT lid, phone_number, created_at, learning_source, updated_at
                 FROM lid_pn_mapping WHERE phone_number = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                params![phone],
                scan_lid_mapping,
            )
            .optional()
            .map_err(db_err)
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO lid_pn_mapping
                 (lid, phone_number, created_at, learning_source, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    entry.lid,
                    entry.phone_number,
                    entry.created_at,
                    entry.learning_source,
                    entry.updated_at,
                ],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn get_all_lid_mappings(&self) -> StoreResult<Vec<LidPnMappingEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT lid, phone_number, created_at, learning_source, updated_at
                 FROM lid_pn_mapping",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], scan_lid_mapping).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn save_base_key(
        &self,
        address: &str,
        message_id: &str,
        base_key: &[u8],
    ) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO base_keys (address, message_id, base_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![address, message_id, base_key, now],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> StoreResult<bool> {
        let saved: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT base_key FROM base_keys WHERE address = ?1 AND message_id = ?2",
                params![address, message_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(saved.is_some_and(|k| k == current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute(
                "DELETE FROM base_keys WHERE address = ?1 AND message_id = ?2",
                params![address, message_id],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> StoreResult<()> {
        let devices_json = serde_json::to_string(&record.devices).map_err(db_err)?;
        let now = chrono::Utc::now().timestamp();
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO device_registry
                 (user_id, devices_json, timestamp, phash, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![record.user, devices_json, record.timestamp, record.phash, now],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn get_devices(&self, user: &str) -> StoreResult<Option<DeviceListRecord>> {
        self.conn
            .lock()
            .query_row(
                "SELECT user_id, devices_json, timestamp, phash
                 FROM device_registry WHERE user_id = ?1",
                params![user],
                |row| {
                    let devices_json: String = row.get(1)?;
                    let devices: Vec<DeviceInfo> = serde_json::from_str(&devices_json)
                        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                    Ok(DeviceListRecord {
                        user: row.get(0)?,
                        devices,
                        timestamp: row.get(2)?,
                        phash: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO sender_key_status (group_jid, participant, marked_at)
                 VALUES (?1, ?2, ?3)",
                params![group_jid, participant, now],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT participant FROM sender_key_status WHERE group_jid = ?1")
            .map_err(db_err)?;
        let marks = stmt
            .query_map(params![group_jid], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        conn.execute(
            "DELETE FROM sender_key_status WHERE group_jid = ?1",
            params![group_jid],
        )
        .map_err(db_err)?;
        Ok(marks)
    }

    async fn get_tc_token(&self, jid: &str) -> StoreResult<Option<TcTokenEntry>> {
        self.conn
            .lock()
            .query_row(
                "SELECT token, token_timestamp, sender_timestamp FROM tc_tokens WHERE jid = ?1",
                params![jid],
                |row| {
                    Ok(TcTokenEntry {
                        token: row.get(0)?,
                        token_timestamp: row.get(1)?,
                        sender_timestamp: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(db_err)
    }

    async fn put_tc_token(&self, jid: &str, entry: &TcTokenEntry) -> StoreResult<()> {
        let now = chrono::Utc::now().timestamp();
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO tc_tokens
                 (jid, token, token_timestamp, sender_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![jid, entry.token, entry.token_timestamp, entry.sender_timestamp, now],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn delete_tc_token(&self, jid: &str) -> StoreResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM tc_tokens WHERE jid = ?1", params![jid])
            .map(|_| ())
            .map_err(db_err)
    }

    async fn get_all_tc_token_jids(&self) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT jid FROM tc_tokens").map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    async fn delete_expired_tc_tokens(&self, cutoff_timestamp: i64) -> StoreResult<u32> {
        let deleted = self
            .conn
            .lock()
            .execute(
                "DELETE FROM tc_tokens WHERE token_timestamp < ?1",
                params![cutoff_timestamp],
            )
            .map_err(db_err)?;
        u32::try_from(deleted).map_err(db_err)
    }
}

#[async_trait]
impl DeviceStore for SessionStore {
    async fn save(&self, device: &CoreDevice) -> StoreResult<()> {
        let account = device.account.as_ref().map(|a| a.encode_to_vec());
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO device (
                    id, lid, pn, registration_id, noise_key, identity_key,
                    signed_pre_key, signed_pre_key_id, signed_pre_key_signature,
                    adv_secret_key, account, push_name, app_version_primary,
                    app_version_secondary, app_version_tertiary,
                    app_version_last_fetched_ms, edge_routing_info, props_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                params![
                    DEVICE_ID,
                    device.lid.as_ref().map(ToString::to_string),
                    device.pn.as_ref().map(ToString::to_string),
                    device.registration_id,
                    encode_key_pair(&device.noise_key),
                    encode_key_pair(&device.identity_key),
                    encode_key_pair(&device.signed_pre_key),
                    device.signed_pre_key_id,
                    device.signed_pre_key_signature.to_vec(),
                    device.adv_secret_key.to_vec(),
                    account,
                    &device.push_name,
                    device.app_version_primary,
                    device.app_version_secondary,
                    device.app_version_tertiary,
                    device.app_version_last_fetched_ms,
                    device.edge_routing_info,
                    device.props_hash,
                ],
            )
            .map(|_| ())
            .map_err(db_err)
    }

    async fn load(&self) -> StoreResult<Option<CoreDevice>> {
        self.conn
            .lock()
            .query_row(
                "SELECT * FROM device WHERE id = ?1",
                params![DEVICE_ID],
                scan_device,
            )
            .optional()
            .map_err(db_err)
    }

    async fn exists(&self) -> StoreResult<bool> {
        let count: i64 = self
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM device WHERE id = ?1",
                params![DEVICE_ID],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        Ok(count > 0)
    }

    async fn create(&self) -> StoreResult<i32> {
        // The single device row is written on first save.
        Ok(DEVICE_ID)
    }

    async fn snapshot_db(&self, name: &str, extra_content: Option<&[u8]>) -> StoreResult<()> {
        let snapshot_path = format!("{}.snapshot.{name}", self.db_path);
        std::fs::copy(&self.db_path, &snapshot_path).map_err(db_err)?;
        if let Some(content) = extra_content {
            std::fs::write(format!("{snapshot_path}.extra"), content).map_err(db_err)?;
        }
        Ok(())
    }
}

/// 64 bytes: private key followed by the public key.
fn encode_key_pair(pair: &wa_rs_core::libsignal::protocol::KeyPair) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(pair.private_key.serialize().as_slice());
    bytes.extend_from_slice(pair.public_key.public_key_bytes());
    bytes
}

fn decode_key_pair(
    bytes: &[u8],
) -> rusqlite::Result<wa_rs_core::libsignal::protocol::KeyPair> {
    use wa_rs_core::libsignal::protocol::{KeyPair, PrivateKey, PublicKey};

    fn conv<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
    }

    if bytes.len() != 64 {
        return Err(rusqlite::Error::InvalidParameterName("key_pair".into()));
    }
    Ok(KeyPair::new(
        PublicKey::from_djb_public_key_bytes(&bytes[32..64]).map_err(conv)?,
        PrivateKey::deserialize(&bytes[0..32]).map_err(conv)?,
    ))
}

fn scan_lid_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<LidPnMappingEntry> {
    Ok(LidPnMappingEntry {
        lid: row.get(0)?,
        phone_number: row.get(1)?,
        created_at: row.get(2)?,
        learning_source: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn scan_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoreDevice> {
    fn conv<E: std::error::Error + Send + Sync + 'static>(e: E) -> rusqlite::Error {
        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
    }

    let lid: Option<String> = row.get("lid")?;
    let pn: Option<String> = row.get("pn")?;
    let signature_bytes: Vec<u8> = row.get("signed_pre_key_signature")?;
    let adv_secret_bytes: Vec<u8> = row.get("adv_secret_key")?;
    if signature_bytes.len() != 64 || adv_secret_bytes.len() != 32 {
        return Err(rusqlite::Error::InvalidParameterName("device_keys".into()));
    }
    let mut signature = [0u8; 64];
    let mut adv_secret = [0u8; 32];
    signature.copy_from_slice(&signature_bytes);
    adv_secret.copy_from_slice(&adv_secret_bytes);

    let account = row
        .get::<_, Option<Vec<u8>>>("account")?
        .map(|bytes| {
            wa_rs_proto::whatsapp::AdvSignedDeviceIdentity::decode(bytes.as_slice()).map_err(conv)
        })
        .transpose()?;

    Ok(CoreDevice {
        lid: lid.and_then(|s| s.parse().ok()),
        pn: pn.and_then(|s| s.parse().ok()),
        registration_id: row.get("registration_id")?,
        noise_key: decode_key_pair(&row.get::<_, Vec<u8>>("noise_key")?)?,
        identity_key: decode_key_pair(&row.get::<_, Vec<u8>>("identity_key")?)?,
        signed_pre_key: decode_key_pair(&row.get::<_, Vec<u8>>("signed_pre_key")?)?,
        signed_pre_key_id: row.get("signed_pre_key_id")?,
        signed_pre_key_signature: signature,
        adv_secret_key: adv_secret,
        account,
        push_name: row.get("push_name")?,
        app_version_primary: row.get("app_version_primary")?,
        app_version_secondary: row.get("app_version_secondary")?,
        app_version_tertiary: row.get("app_version_tertiary")?,
        app_version_last_fetched_ms: row.get("app_version_last_fetched_ms")?,
        edge_routing_info: row.get("edge_routing_info")?,
        props_hash: row.get("props_hash")?,
        ..Default::default()
    })
}
