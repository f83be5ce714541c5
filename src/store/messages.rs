//! Message persistence: widening upserts and timeline reads.
//!
//! The protocol delivers the same message in several shapes (live event,
//! history sync, on-demand backfill), so the upsert only ever fills empty
//! fields, advances the timestamp, or attaches media metadata. Applying the
//! same set of shapes in any order converges on the same row. The download
//! columns (`local_path`, `downloaded_at`) belong to the media worker and
//! are never touched here.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::types::{from_unix, unix, Message, MessageInfo, UpsertMessageParams};
use super::Store;
use crate::errors::{row_or_not_found, Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ListMessagesParams {
    pub chat_jid: String,
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Store {
    /// Widening upsert keyed by (chat, msg id). Returns `true` when the row
    /// was newly inserted (the sync loop counts those).
    pub fn upsert_message(&self, p: &UpsertMessageParams) -> Result<bool> {
        if p.chat_jid.trim().is_empty() || p.msg_id.trim().is_empty() {
            return Err(Error::invalid("chat_jid and msg_id are required"));
        }
        let conn = self.conn();
        let existed: bool = conn
            .query_row(
                "SELECT 1 FROM messages WHERE chat_jid = ?1 AND msg_id = ?2",
                params![p.chat_jid, p.msg_id],
                |_| Ok(true),
            )
            .unwrap_or(false);

        conn.execute(
            "INSERT INTO messages(
                 chat_jid, msg_id, sender_jid, sender_name, chat_name, ts, from_me,
                 text, display_text, media_type, media_caption, filename, mime_type,
                 direct_path, media_key, file_sha256, file_enc_sha256, file_length)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
             ON CONFLICT(chat_jid, msg_id) DO UPDATE SET
                 sender_jid      = COALESCE(NULLIF(excluded.sender_jid,''), messages.sender_jid),
                 sender_name     = COALESCE(NULLIF(excluded.sender_name,''), messages.sender_name),
                 chat_name       = COALESCE(NULLIF(excluded.chat_name,''), messages.chat_name),
                 ts              = CASE WHEN excluded.ts > COALESCE(messages.ts,0)
                                        THEN excluded.ts ELSE messages.ts END,
                 from_me         = MAX(messages.from_me, excluded.from_me),
                 text            = COALESCE(NULLIF(excluded.text,''), messages.text),
                 display_text    = COALESCE(NULLIF(excluded.display_text,''), messages.display_text),
                 media_type      = COALESCE(NULLIF(excluded.media_type,''), messages.media_type),
                 media_caption   = COALESCE(NULLIF(excluded.media_caption,''), messages.media_caption),
                 filename        = COALESCE(NULLIF(excluded.filename,''), messages.filename),
                 mime_type       = COALESCE(NULLIF(excluded.mime_type,''), messages.mime_type),
                 direct_path     = COALESCE(NULLIF(excluded.direct_path,''), messages.direct_path),
                 media_key       = COALESCE(excluded.media_key, messages.media_key),
                 file_sha256     = COALESCE(excluded.file_sha256, messages.file_sha256),
                 file_enc_sha256 = COALESCE(excluded.file_enc_sha256, messages.file_enc_sha256),
                 file_length     = CASE WHEN COALESCE(excluded.file_length,0) > 0
                                        THEN excluded.file_length ELSE messages.file_length END",
            params![
                p.chat_jid,
                p.msg_id,
                p.sender_jid,
                p.sender_name,
                p.chat_name,
                unix(p.timestamp),
                p.from_me as i64,
                p.text,
                p.display_text,
                p.media_type,
                p.media_caption,
                p.filename,
                p.mime_type,
                p.direct_path,
                p.media_key,
                p.file_sha256,
                p.file_enc_sha256,
                p.file_length as i64,
            ],
        )?;
        Ok(!existed)
    }

    /// Timeline listing, newest first, with optional chat and time bounds.
    pub fn list_messages(&self, p: &ListMessagesParams) -> Result<Vec<Message>> {
        let limit = if p.limit == 0 { 50 } else { p.limit };
        let conn = self.conn();

        let mut sql = String::from(
            "SELECT m.chat_jid, COALESCE(c.name,''), m.msg_id, COALESCE(m.sender_jid,''),
                    m.ts, m.from_me, COALESCE(m.text,''), COALESCE(m.display_text,''),
                    COALESCE(m.media_type,''), ''
             FROM messages m
             LEFT JOIN chats c ON c.jid = m.chat_jid
             WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if !p.chat_jid.trim().is_empty() {
            sql.push_str(" AND m.chat_jid = ?");
            args.push(Box::new(p.chat_jid.clone()));
        }
        if let Some(after) = p.after {
            sql.push_str(" AND m.ts > ?");
            args.push(Box::new(after.timestamp()));
        }
        if let Some(before) = p.before {
            sql.push_str(" AND m.ts < ?");
            args.push(Box::new(before.timestamp()));
        }
        sql.push_str(" ORDER BY m.ts DESC, m.msg_id ASC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            scan_message,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_message(&self, chat_jid: &str, msg_id: &str) -> Result<Message> {
        let conn = self.conn();
        row_or_not_found(
            conn.query_row(
                "SELECT m.chat_jid, COALESCE(c.name,''), m.msg_id, COALESCE(m.sender_jid,''),
                        m.ts, m.from_me, COALESCE(m.text,''), COALESCE(m.display_text,''),
                        COALESCE(m.media_type,''), ''
                 FROM messages m
                 LEFT JOIN chats c ON c.jid = m.chat_jid
                 WHERE m.chat_jid = ?1 AND m.msg_id = ?2",
                params![chat_jid, msg_id],
                scan_message,
            ),
            "message",
        )
    }

    /// The pivot message plus up to `before` older and `after` newer rows in
    /// the same chat, returned oldest-first.
    pub fn message_context(
        &self,
        chat_jid: &str,
        msg_id: &str,
        before: usize,
        after: usize,
    ) -> Result<Vec<Message>> {
        let pivot = self.get_message(chat_jid, msg_id)?;
        let pivot_ts = unix(pivot.timestamp);
        let conn = self.conn();

        let mut older: Vec<Message> = {
            let mut stmt = conn.prepare(
                "SELECT m.chat_jid, COALESCE(c.name,''), m.msg_id, COALESCE(m.sender_jid,''),
                        m.ts, m.from_me, COALESCE(m.text,''), COALESCE(m.display_text,''),
                        COALESCE(m.media_type,''), ''
                 FROM messages m
                 LEFT JOIN chats c ON c.jid = m.chat_jid
                 WHERE m.chat_jid = ?1 AND (m.ts < ?2 OR (m.ts = ?2 AND m.msg_id < ?3))
                 ORDER BY m.ts DESC, m.msg_id DESC LIMIT ?4",
            )?;
            let rows =
                stmt.query_map(params![chat_jid, pivot_ts, msg_id, before as i64], scan_message)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        older.reverse();

        let newer: Vec<Message> = {
            let mut stmt = conn.prepare(
                "SELECT m.chat_jid, COALESCE(c.name,''), m.msg_id, COALESCE(m.sender_jid,''),
                        m.ts, m.from_me, COALESCE(m.text,''), COALESCE(m.display_text,''),
                        COALESCE(m.media_type,''), ''
                 FROM messages m
                 LEFT JOIN chats c ON c.jid = m.chat_jid
                 WHERE m.chat_jid = ?1 AND (m.ts > ?2 OR (m.ts = ?2 AND m.msg_id > ?3))
                 ORDER BY m.ts ASC, m.msg_id ASC LIMIT ?4",
            )?;
            let rows =
                stmt.query_map(params![chat_jid, pivot_ts, msg_id, after as i64], scan_message)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        older.push(pivot);
        older.extend(newer);
        Ok(older)
    }

    /// Backfill cursor: the oldest known message of a chat.
    pub fn get_oldest_message_info(&self, chat_jid: &str) -> Result<MessageInfo> {
        let conn = self.conn();
        row_or_not_found(
            conn.query_row(
                "SELECT chat_jid, msg_id, ts, from_me, COALESCE(sender_jid,''), COALESCE(sender_name,'')
                 FROM messages WHERE chat_jid = ?1
                 ORDER BY ts ASC, msg_id ASC LIMIT 1",
                params![chat_jid],
                |row| {
                    Ok(MessageInfo {
                        chat_jid: row.get(0)?,
                        msg_id: row.get(1)?,
                        timestamp: from_unix(row.get(2)?),
                        from_me: row.get::<_, i64>(3)? != 0,
                        sender_jid: row.get(4)?,
                        sender_name: row.get(5)?,
                    })
                },
            ),
            "message",
        )
    }
}

fn scan_message(row: &rusqlite::Row<'_>) -> std::result::Result<Message, rusqlite::Error> {
    Ok(Message {
        chat_jid: row.get(0)?,
        chat_name: row.get(1)?,
        msg_id: row.get(2)?,
        sender_jid: row.get(3)?,
        timestamp: from_unix(row.get(4)?),
        from_me: row.get::<_, i64>(5)? != 0,
        text: row.get(6)?,
        display_text: row.get(7)?,
        media_type: row.get(8)?,
        snippet: row.get(9)?,
    })
}
