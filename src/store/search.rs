//! Message search, FTS5-ranked when available, LIKE-scanned otherwise.
//! Both paths accept the same filter set so callers never know which engine
//! answered.

use chrono::{DateTime, Utc};
use rusqlite::types::ToSql;

use super::types::{from_unix, null_if_empty, Message};
use super::Store;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct SearchMessagesParams {
    pub query: String,
    pub chat_jid: String,
    pub from: String,
    pub media_type: String,
    pub before: Option<DateTime<Utc>>,
    pub after: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Store {
    pub fn search_messages(&self, p: &SearchMessagesParams) -> Result<Vec<Message>> {
        if null_if_empty(&p.query).is_none() {
            return Err(Error::invalid("query is required"));
        }
        if self.has_fts() {
            self.search_fts(p)
        } else {
            self.search_like(p)
        }
    }

    fn search_fts(&self, p: &SearchMessagesParams) -> Result<Vec<Message>> {
        let limit = effective_limit(p.limit);
        let mut sql = String::from(
            "SELECT m.chat_jid, COALESCE(c.name,''), m.msg_id, COALESCE(m.sender_jid,''),
                    m.ts, m.from_me, COALESCE(m.text,''), COALESCE(m.display_text,''),
                    COALESCE(m.media_type,''),
                    snippet(messages_fts, 0, '[', ']', '…', 12)
             FROM messages_fts
             JOIN messages m ON messages_fts.rowid = m.rowid
             LEFT JOIN chats c ON c.jid = m.chat_jid
             WHERE messages_fts MATCH ?",
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(p.query.clone())];
        apply_filters(&mut sql, &mut args, p);
        sql.push_str(" ORDER BY bm25(messages_fts) LIMIT ?");
        args.push(Box::new(limit as i64));
        self.scan_search(&sql, &args)
    }

    fn search_like(&self, p: &SearchMessagesParams) -> Result<Vec<Message>> {
        let limit = effective_limit(p.limit);
        let needle = format!("%{}%", p.query);
        let mut sql = String::from(
            "SELECT m.chat_jid, COALESCE(c.name,''), m.msg_id, COALESCE(m.sender_jid,''),
                    m.ts, m.from_me, COALESCE(m.text,''), COALESCE(m.display_text,''),
                    COALESCE(m.media_type,''), ''
             FROM messages m
             LEFT JOIN chats c ON c.jid = m.chat_jid
             WHERE (LOWER(COALESCE(m.text,''))          LIKE LOWER(?1)
                 OR LOWER(COALESCE(m.display_text,''))  LIKE LOWER(?1)
                 OR LOWER(COALESCE(m.media_caption,'')) LIKE LOWER(?1)
                 OR LOWER(COALESCE(m.filename,''))      LIKE LOWER(?1)
                 OR LOWER(COALESCE(m.chat_name,''))     LIKE LOWER(?1)
                 OR LOWER(COALESCE(m.sender_name,''))   LIKE LOWER(?1)
                 OR LOWER(COALESCE(c.name,''))          LIKE LOWER(?1))",
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(needle)];
        apply_filters(&mut sql, &mut args, p);
        sql.push_str(" ORDER BY m.ts DESC, m.msg_id ASC LIMIT ?");
        args.push(Box::new(limit as i64));
        self.scan_search(&sql, &args)
    }

    fn scan_search(&self, sql: &str, args: &[Box<dyn ToSql>]) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
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
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

fn effective_limit(limit: usize) -> usize {
    if limit == 0 {
        50
    } else {
        limit
    }
}

fn apply_filters(sql: &mut String, args: &mut Vec<Box<dyn ToSql>>, p: &SearchMessagesParams) {
    if let Some(chat) = null_if_empty(&p.chat_jid) {
        sql.push_str(" AND m.chat_jid = ?");
        args.push(Box::new(chat.to_string()));
    }
    if let Some(from) = null_if_empty(&p.from) {
        sql.push_str(" AND m.sender_jid = ?");
        args.push(Box::new(from.to_string()));
    }
    if let Some(after) = p.after {
        sql.push_str(" AND m.ts > ?");
        args.push(Box::new(after.timestamp()));
    }
    if let Some(before) = p.before {
        sql.push_str(" AND m.ts < ?");
        args.push(Box::new(before.timestamp()));
    }
    if let Some(mt) = null_if_empty(&p.media_type) {
        sql.push_str(" AND COALESCE(m.media_type,'') = ?");
        args.push(Box::new(mt.to_string()));
    }
}
