use chrono::{DateTime, Utc};
use rusqlite::params;

use super::types::{from_unix, null_if_empty, unix, Chat};
use super::Store;
use crate::errors::{row_or_not_found, Result};

impl Store {
    /// Insert or widen a chat row. The name only overwrites when the new
    /// value is non-empty; `last_message_ts` only ever advances.
    pub fn upsert_chat(
        &self,
        jid: &str,
        kind: &str,
        name: &str,
        last_ts: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let kind = if kind.trim().is_empty() {
            "unknown"
        } else {
            kind
        };
        self.conn().execute(
            "INSERT INTO chats(jid, kind, name, last_message_ts)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(jid) DO UPDATE SET
                 kind = excluded.kind,
                 name = COALESCE(NULLIF(excluded.name, ''), chats.name),
                 last_message_ts = CASE
                     WHEN excluded.last_message_ts > COALESCE(chats.last_message_ts, 0)
                     THEN excluded.last_message_ts
                     ELSE chats.last_message_ts
                 END",
            params![jid, kind, name, unix(last_ts)],
        )?;
        Ok(())
    }

    /// Case-insensitive substring match on name or jid, newest chat first.
    pub fn list_chats(&self, query: &str, limit: usize) -> Result<Vec<Chat>> {
        let limit = if limit == 0 { 50 } else { limit };
        let conn = self.conn();

        let mut sql = String::from(
            "SELECT jid, kind, COALESCE(name,''), COALESCE(last_message_ts,0)
             FROM chats WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(q) = null_if_empty(query) {
            sql.push_str(" AND (LOWER(name) LIKE LOWER(?) OR LOWER(jid) LIKE LOWER(?))");
            let needle = format!("%{q}%");
            args.push(Box::new(needle.clone()));
            args.push(Box::new(needle));
        }
        sql.push_str(" ORDER BY COALESCE(last_message_ts,0) DESC LIMIT ?");
        args.push(Box::new(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(Chat {
                jid: row.get(0)?,
                kind: row.get(1)?,
                name: row.get(2)?,
                last_message_ts: from_unix(row.get(3)?),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_chat(&self, jid: &str) -> Result<Chat> {
        let conn = self.conn();
        row_or_not_found(
            conn.query_row(
                "SELECT jid, kind, COALESCE(name,''), COALESCE(last_message_ts,0)
                 FROM chats WHERE jid = ?1",
                params![jid],
                |row| {
                    Ok(Chat {
                        jid: row.get(0)?,
                        kind: row.get(1)?,
                        name: row.get(2)?,
                        last_message_ts: from_unix(row.get(3)?),
                    })
                },
            ),
            "chat",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use chrono::TimeZone;

    fn ts(secs: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn last_message_ts_is_monotonic() {
        let s = Store::open_in_memory().unwrap();
        s.upsert_chat("1@s.whatsapp.net", "dm", "Alice", ts(1000))
            .unwrap();
        s.upsert_chat("1@s.whatsapp.net", "dm", "Alice", ts(900))
            .unwrap();
        let c = s.get_chat("1@s.whatsapp.net").unwrap();
        assert_eq!(c.last_message_ts, ts(1000));

        s.upsert_chat("1@s.whatsapp.net", "dm", "Alice", ts(1100))
            .unwrap();
        let c = s.get_chat("1@s.whatsapp.net").unwrap();
        assert_eq!(c.last_message_ts, ts(1100));
    }

    #[test]
    fn empty_name_never_clobbers() {
        let s = Store::open_in_memory().unwrap();
        s.upsert_chat("1@s.whatsapp.net", "dm", "Alice", ts(1))
            .unwrap();
        s.upsert_chat("1@s.whatsapp.net", "dm", "", ts(2)).unwrap();
        assert_eq!(s.get_chat("1@s.whatsapp.net").unwrap().name, "Alice");
    }

    #[test]
    fn blank_kind_defaults_to_unknown() {
        let s = Store::open_in_memory().unwrap();
        s.upsert_chat("x@g.us", " ", "Team", None).unwrap();
        assert_eq!(s.get_chat("x@g.us").unwrap().kind, "unknown");
    }

    #[test]
    fn list_filters_and_orders_by_recency() {
        let s = Store::open_in_memory().unwrap();
        s.upsert_chat("1@s.whatsapp.net", "dm", "Alice", ts(100))
            .unwrap();
        s.upsert_chat("2@s.whatsapp.net", "dm", "Bob", ts(200))
            .unwrap();
        s.upsert_chat("3@g.us", "group", "Alice Fans", ts(150))
            .unwrap();

        let all = s.list_chats("", 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].jid, "2@s.whatsapp.net");

        let alices = s.list_chats("alice", 10).unwrap();
        assert_eq!(alices.len(), 2);
        assert_eq!(alices[0].jid, "3@g.us");
    }

    #[test]
    fn missing_chat_is_not_found() {
        let s = Store::open_in_memory().unwrap();
        assert!(matches!(
            s.get_chat("nobody@s.whatsapp.net"),
            Err(Error::NotFound(_))
        ));
    }
}
