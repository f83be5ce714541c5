use chrono::{DateTime, Utc};
use rusqlite::params;

use super::types::{from_unix, unix, MediaDownloadInfo};
use super::Store;
use crate::errors::{row_or_not_found, Result};

impl Store {
    /// The decryption tuple plus naming hints for one message's attachment.
    pub fn get_media_download_info(&self, chat_jid: &str, msg_id: &str) -> Result<MediaDownloadInfo> {
        let conn = self.conn();
        row_or_not_found(
            conn.query_row(
                "SELECT m.chat_jid,
                        COALESCE(c.name,''),
                        m.msg_id,
                        COALESCE(m.media_type,''),
                        COALESCE(m.filename,''),
                        COALESCE(m.mime_type,''),
                        COALESCE(m.direct_path,''),
                        m.media_key,
                        m.file_sha256,
                        m.file_enc_sha256,
                        COALESCE(m.file_length,0),
                        COALESCE(m.local_path,''),
                        COALESCE(m.downloaded_at,0)
                 FROM messages m
                 LEFT JOIN chats c ON c.jid = m.chat_jid
                 WHERE m.chat_jid = ?1 AND m.msg_id = ?2",
                params![chat_jid, msg_id],
                |row| {
                    Ok(MediaDownloadInfo {
                        chat_jid: row.get(0)?,
                        chat_name: row.get(1)?,
                        msg_id: row.get(2)?,
                        media_type: row.get(3)?,
                        filename: row.get(4)?,
                        mime_type: row.get(5)?,
                        direct_path: row.get(6)?,
                        media_key: row.get::<_, Option<Vec<u8>>>(7)?.unwrap_or_default(),
                        file_sha256: row.get::<_, Option<Vec<u8>>>(8)?.unwrap_or_default(),
                        file_enc_sha256: row.get::<_, Option<Vec<u8>>>(9)?.unwrap_or_default(),
                        file_length: row.get::<_, i64>(10)?.max(0) as u64,
                        local_path: row.get(11)?,
                        downloaded_at: from_unix(row.get(12)?),
                    })
                },
            ),
            "message",
        )
    }

    /// Record where the media worker materialized the file. Only the worker
    /// writes these two columns.
    pub fn mark_media_downloaded(
        &self,
        chat_jid: &str,
        msg_id: &str,
        local_path: &str,
        downloaded_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE messages SET local_path = ?1, downloaded_at = ?2
             WHERE chat_jid = ?3 AND msg_id = ?4",
            params![local_path, unix(Some(downloaded_at)), chat_jid, msg_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UpsertMessageParams;
    use chrono::TimeZone;

    #[test]
    fn tuple_round_trips_and_marking_sets_both_columns() {
        let s = Store::open_in_memory().unwrap();
        let chat = "1@s.whatsapp.net";
        s.upsert_message(&UpsertMessageParams {
            chat_jid: chat.into(),
            msg_id: "m1".into(),
            sender_jid: chat.into(),
            timestamp: Some(Utc.timestamp_opt(100, 0).unwrap()),
            media_type: "image".into(),
            filename: "pic.jpg".into(),
            mime_type: "image/jpeg".into(),
            direct_path: "/d/path".into(),
            media_key: Some(vec![1, 2, 3]),
            file_sha256: Some(vec![4, 5]),
            file_enc_sha256: Some(vec![6, 7]),
            file_length: 123,
            ..Default::default()
        })
        .unwrap();

        let info = s.get_media_download_info(chat, "m1").unwrap();
        assert_eq!(info.media_type, "image");
        assert_eq!(info.media_key, vec![1, 2, 3]);
        assert_eq!(info.file_length, 123);
        assert!(info.local_path.is_empty());
        assert!(info.downloaded_at.is_none());

        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        s.mark_media_downloaded(chat, "m1", "/store/media/2023/11/pic.jpg", now)
            .unwrap();
        let info = s.get_media_download_info(chat, "m1").unwrap();
        assert_eq!(info.local_path, "/store/media/2023/11/pic.jpg");
        assert_eq!(info.downloaded_at, Some(now));
    }

    #[test]
    fn message_without_media_has_empty_tuple() {
        let s = Store::open_in_memory().unwrap();
        let chat = "1@s.whatsapp.net";
        s.upsert_message(&UpsertMessageParams {
            chat_jid: chat.into(),
            msg_id: "m1".into(),
            text: "plain".into(),
            timestamp: Some(Utc.timestamp_opt(100, 0).unwrap()),
            ..Default::default()
        })
        .unwrap();
        let info = s.get_media_download_info(chat, "m1").unwrap();
        assert!(info.direct_path.is_empty());
        assert!(info.media_key.is_empty());
    }
}
