//! Row types returned by store queries.
//!
//! Timestamps are stored as unix seconds and surfaced as `DateTime<Utc>`;
//! the zero timestamp serializes as `null`. Byte blobs never appear in JSON.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Chat {
    pub jid: String,
    pub kind: String,
    pub name: String,
    #[serde(serialize_with = "ser_ts")]
    pub last_message_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    pub jid: String,
    pub phone: String,
    pub alias: String,
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(serialize_with = "ser_ts")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Group {
    pub jid: String,
    pub name: String,
    pub owner_jid: String,
    #[serde(serialize_with = "ser_ts")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(serialize_with = "ser_ts")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupParticipant {
    pub group_jid: String,
    pub user_jid: String,
    pub role: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub chat_jid: String,
    pub chat_name: String,
    pub msg_id: String,
    pub sender_jid: String,
    #[serde(serialize_with = "ser_ts")]
    pub timestamp: Option<DateTime<Utc>>,
    pub from_me: bool,
    pub text: String,
    pub display_text: String,
    pub media_type: String,
    pub snippet: String,
}

/// The minimal identity of a message, used as the backfill cursor.
#[derive(Debug, Clone, Serialize)]
pub struct MessageInfo {
    pub chat_jid: String,
    pub msg_id: String,
    #[serde(serialize_with = "ser_ts")]
    pub timestamp: Option<DateTime<Utc>>,
    pub from_me: bool,
    pub sender_jid: String,
    pub sender_name: String,
}

/// Everything the media worker needs to fetch and decrypt one attachment.
/// The key material is deliberately excluded from JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct MediaDownloadInfo {
    pub chat_jid: String,
    pub chat_name: String,
    pub msg_id: String,
    pub media_type: String,
    pub filename: String,
    pub mime_type: String,
    pub direct_path: String,
    #[serde(skip)]
    pub media_key: Vec<u8>,
    #[serde(skip)]
    pub file_sha256: Vec<u8>,
    #[serde(skip)]
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
    pub local_path: String,
    #[serde(serialize_with = "ser_ts")]
    pub downloaded_at: Option<DateTime<Utc>>,
}

/// Input to the widening message upsert. Empty strings and `None` blobs mean
/// "no information"; they never clobber an existing value.
#[derive(Debug, Clone, Default)]
pub struct UpsertMessageParams {
    pub chat_jid: String,
    pub msg_id: String,
    pub sender_jid: String,
    pub sender_name: String,
    pub chat_name: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub from_me: bool,
    pub text: String,
    pub display_text: String,
    pub media_type: String,
    pub media_caption: String,
    pub filename: String,
    pub mime_type: String,
    pub direct_path: String,
    pub media_key: Option<Vec<u8>>,
    pub file_sha256: Option<Vec<u8>>,
    pub file_enc_sha256: Option<Vec<u8>>,
    pub file_length: u64,
}

pub(crate) fn unix(t: Option<DateTime<Utc>>) -> i64 {
    t.map_or(0, |t| t.timestamp())
}

pub(crate) fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

/// Empty or whitespace-only strings become SQL NULL so the widening
/// `COALESCE(NULLIF(...))` rules stay simple on the query side.
pub(crate) fn null_if_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn ser_ts<S: serde::Serializer>(
    t: &Option<DateTime<Utc>>,
    ser: S,
) -> std::result::Result<S::Ok, S::Error> {
    match t {
        Some(t) => ser.serialize_str(&t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        None => ser.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_round_trip() {
        let t = from_unix(1_700_000_000).unwrap();
        assert_eq!(unix(Some(t)), 1_700_000_000);
        assert_eq!(unix(None), 0);
        assert!(from_unix(0).is_none());
    }

    #[test]
    fn null_if_empty_trims() {
        assert_eq!(null_if_empty("  "), None);
        assert_eq!(null_if_empty(" x "), Some("x"));
    }

    #[test]
    fn media_info_json_omits_key_material() {
        let info = MediaDownloadInfo {
            chat_jid: "1@s.whatsapp.net".into(),
            chat_name: String::new(),
            msg_id: "m".into(),
            media_type: "image".into(),
            filename: String::new(),
            mime_type: String::new(),
            direct_path: "/d".into(),
            media_key: vec![1, 2, 3],
            file_sha256: vec![4],
            file_enc_sha256: vec![5],
            file_length: 9,
            local_path: String::new(),
            downloaded_at: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("media_key"));
        assert!(!json.contains("file_sha256"));
    }

    #[test]
    fn timestamps_serialize_rfc3339_utc() {
        let chat = Chat {
            jid: "1@s.whatsapp.net".into(),
            kind: "dm".into(),
            name: "Alice".into(),
            last_message_ts: from_unix(1_700_000_000),
        };
        let json = serde_json::to_string(&chat).unwrap();
        assert!(json.contains("2023-11-14T22:13:20Z"));
    }
}
