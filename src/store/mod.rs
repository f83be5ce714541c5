//! SQLite-backed mirror of the linked account.
//!
//! One database file, `wacli.db`, under the store directory. The connection
//! is shared behind a mutex; SQLite's WAL mode handles cross-process readers.
//! Schema creation is idempotent and forward-only. FTS5 is probed once at
//! open: when the runtime lacks the extension the store flips to `LIKE`
//! scans with an identical query surface.

mod chats;
mod contacts;
mod groups;
mod media;
mod messages;
mod search;
mod types;

pub use messages::ListMessagesParams;
pub use search::SearchMessagesParams;
pub use types::{
    Chat, Contact, Group, GroupParticipant, MediaDownloadInfo, Message, MessageInfo,
    UpsertMessageParams,
};

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::errors::{Error, Result};

pub(crate) use types::from_unix;

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS schema_migrations (
        version    INTEGER PRIMARY KEY,
        applied_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chats (
        jid             TEXT PRIMARY KEY,
        kind            TEXT NOT NULL DEFAULT 'unknown',
        name            TEXT,
        last_message_ts INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_chats_last_ts ON chats(last_message_ts DESC);

    CREATE TABLE IF NOT EXISTS contacts (
        jid           TEXT PRIMARY KEY,
        phone         TEXT,
        push_name     TEXT,
        full_name     TEXT,
        first_name    TEXT,
        business_name TEXT,
        updated_at    INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS contact_aliases (
        jid        TEXT PRIMARY KEY,
        alias      TEXT NOT NULL,
        notes      TEXT,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS contact_tags (
        jid        TEXT NOT NULL,
        tag        TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (jid, tag)
    );

    CREATE TABLE IF NOT EXISTS groups (
        jid        TEXT PRIMARY KEY,
        name       TEXT,
        owner_jid  TEXT,
        created_ts INTEGER,
        updated_at INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS group_participants (
        group_jid  TEXT NOT NULL,
        user_jid   TEXT NOT NULL,
        role       TEXT NOT NULL DEFAULT 'member',
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (group_jid, user_jid)
    );

    CREATE TABLE IF NOT EXISTS messages (
        chat_jid        TEXT NOT NULL,
        msg_id          TEXT NOT NULL,
        sender_jid      TEXT,
        sender_name     TEXT,
        chat_name       TEXT,
        ts              INTEGER NOT NULL DEFAULT 0,
        from_me         INTEGER NOT NULL DEFAULT 0,
        text            TEXT,
        display_text    TEXT,
        media_type      TEXT,
        media_caption   TEXT,
        filename        TEXT,
        mime_type       TEXT,
        direct_path     TEXT,
        media_key       BLOB,
        file_sha256     BLOB,
        file_enc_sha256 BLOB,
        file_length     INTEGER,
        local_path      TEXT,
        downloaded_at   INTEGER,
        PRIMARY KEY (chat_jid, msg_id)
    );
    CREATE INDEX IF NOT EXISTS idx_messages_chat_ts ON messages(chat_jid, ts);
    CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts DESC);
";

/// FTS5 index over the searchable message columns, kept in lock-step with
/// `messages` by triggers. Applied as one batch: if the runtime lacks FTS5
/// the whole batch fails and the store falls back to LIKE scans.
const FTS_SCHEMA: &str = "
    CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
        text, display_text, media_caption, filename, chat_name, sender_name,
        content=messages, content_rowid=rowid
    );

    CREATE TRIGGER IF NOT EXISTS messages_fts_ai AFTER INSERT ON messages BEGIN
        INSERT INTO messages_fts(rowid, text, display_text, media_caption, filename, chat_name, sender_name)
        VALUES (new.rowid, new.text, new.display_text, new.media_caption, new.filename, new.chat_name, new.sender_name);
    END;
    CREATE TRIGGER IF NOT EXISTS messages_fts_ad AFTER DELETE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, text, display_text, media_caption, filename, chat_name, sender_name)
        VALUES ('delete', old.rowid, old.text, old.display_text, old.media_caption, old.filename, old.chat_name, old.sender_name);
    END;
    CREATE TRIGGER IF NOT EXISTS messages_fts_au AFTER UPDATE ON messages BEGIN
        INSERT INTO messages_fts(messages_fts, rowid, text, display_text, media_caption, filename, chat_name, sender_name)
        VALUES ('delete', old.rowid, old.text, old.display_text, old.media_caption, old.filename, old.chat_name, old.sender_name);
        INSERT INTO messages_fts(rowid, text, display_text, media_caption, filename, chat_name, sender_name)
        VALUES (new.rowid, new.text, new.display_text, new.media_caption, new.filename, new.chat_name, new.sender_name);
    END;
";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    fts_enabled: bool,
}

impl Store {
    /// Open (or create) the mirror database and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str().is_empty() {
            return Err(Error::invalid("db path is required"));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![SCHEMA_VERSION, chrono::Utc::now().timestamp()],
        )?;

        let fts_enabled = match conn.execute_batch(FTS_SCHEMA) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("FTS5 unavailable, search falls back to LIKE scans: {e}");
                false
            }
        };

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            fts_enabled,
        })
    }

    /// Open an existing database without creating anything. Readers use this
    /// to inspect a store another process is writing to.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let fts_enabled = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='messages_fts'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .unwrap_or(false);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            fts_enabled,
        })
    }

    #[cfg(test)]
    pub(crate) fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        let fts_enabled = conn.execute_batch(FTS_SCHEMA).is_ok();
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            fts_enabled,
        })
    }

    pub fn has_fts(&self) -> bool {
        self.fts_enabled
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    // Keep these consistent for writers and readers.
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous  = NORMAL;
         PRAGMA temp_store   = MEMORY;
         PRAGMA foreign_keys = ON;",
    )?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_schema_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wacli.db");
        let s1 = Store::open(&path).unwrap();
        drop(s1);
        // Second open over the same file must not fail or re-migrate.
        let s2 = Store::open(&path).unwrap();
        let version: i64 = s2
            .conn()
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn fts_probe_reports_capability() {
        let dir = tempfile::tempdir().unwrap();
        let s = Store::open(&dir.path().join("wacli.db")).unwrap();
        // Bundled SQLite ships FTS5; the flag must agree with the probe.
        assert!(s.has_fts());
    }

    #[test]
    fn read_only_open_sees_writer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wacli.db");
        let writer = Store::open(&path).unwrap();
        let reader = Store::open_read_only(&path).unwrap();
        assert_eq!(writer.has_fts(), reader.has_fts());
    }

    #[test]
    fn empty_path_is_invalid() {
        assert!(matches!(
            Store::open(Path::new("")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn fts_stays_in_lockstep_with_messages() {
        let s = Store::open_in_memory().unwrap();
        assert!(s.has_fts());

        for (id, text) in [("a", "alpha wolf"), ("b", "beta fish"), ("c", "gamma ray")] {
            s.upsert_message(&crate::store::UpsertMessageParams {
                chat_jid: "1@s.whatsapp.net".into(),
                msg_id: id.into(),
                timestamp: crate::store::from_unix(100),
                text: text.into(),
                ..Default::default()
            })
            .unwrap();
        }
        // Widening update fires the FTS update trigger, not a second insert.
        s.upsert_message(&crate::store::UpsertMessageParams {
            chat_jid: "1@s.whatsapp.net".into(),
            msg_id: "a".into(),
            timestamp: crate::store::from_unix(100),
            media_type: "image".into(),
            media_caption: "lone howl".into(),
            ..Default::default()
        })
        .unwrap();

        let conn = s.conn();
        let messages: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))
            .unwrap();
        let indexed: i64 = conn
            .query_row("SELECT COUNT(*) FROM messages_fts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(messages, indexed);
        drop(conn);

        // The re-indexed row is searchable by its new caption.
        let hits = s
            .search_messages(&crate::store::SearchMessagesParams {
                query: "howl".into(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].msg_id, "a");
    }
}
