//! JID parsing and classification.
//!
//! A JID is `<user>@<server>`: `s.whatsapp.net` for people, `g.us` for
//! groups, `broadcast` for broadcast lists. Inputs from flags may also be a
//! bare phone number, which normalizes to a user JID.

use std::fmt;
use std::str::FromStr;

use crate::errors::{Error, Result};

pub const DEFAULT_USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
pub const BROADCAST_SERVER: &str = "broadcast";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    user: String,
    server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    pub fn user_jid(phone_digits: impl Into<String>) -> Self {
        Self::new(phone_digits, DEFAULT_USER_SERVER)
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    /// Chat kind tag for the `chats` table.
    pub fn chat_kind(&self) -> &'static str {
        match self.server.as_str() {
            DEFAULT_USER_SERVER => "dm",
            GROUP_SERVER => "group",
            BROADCAST_SERVER => "broadcast",
            _ => "unknown",
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let Some((user, server)) = trimmed.split_once('@') else {
            return Err(Error::invalid(format!("not a JID (missing @): {trimmed:?}")));
        };
        if user.is_empty() || server.is_empty() {
            return Err(Error::invalid(format!("malformed JID: {trimmed:?}")));
        }
        Ok(Self::new(user, server))
    }
}

/// Accept either a full JID or a bare phone number (digits, optionally with
/// `+` or separators) and produce a user JID.
pub fn parse_user_or_jid(input: &str) -> Result<Jid> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid("user is required"));
    }
    if trimmed.contains('@') {
        return trimmed.parse();
    }
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return Err(Error::invalid(format!(
            "not a phone number or JID: {trimmed:?}"
        )));
    }
    Ok(Jid::user_jid(digits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_round_trips() {
        let jid: Jid = "123@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid.user(), "123");
        assert_eq!(jid.server(), DEFAULT_USER_SERVER);
        assert_eq!(jid.to_string(), "123@s.whatsapp.net");
    }

    #[test]
    fn kind_follows_server() {
        assert_eq!(Jid::new("1", DEFAULT_USER_SERVER).chat_kind(), "dm");
        assert_eq!(Jid::new("1", GROUP_SERVER).chat_kind(), "group");
        assert_eq!(Jid::new("1", BROADCAST_SERVER).chat_kind(), "broadcast");
        assert_eq!(Jid::new("1", "weird.server").chat_kind(), "unknown");
    }

    #[test]
    fn phone_numbers_normalize() {
        assert_eq!(
            parse_user_or_jid("+1 (555) 123-4567").unwrap().to_string(),
            "15551234567@s.whatsapp.net"
        );
        assert_eq!(
            parse_user_or_jid("123@g.us").unwrap().to_string(),
            "123@g.us"
        );
    }

    #[test]
    fn junk_is_rejected() {
        assert!(parse_user_or_jid("").is_err());
        assert!(parse_user_or_jid("not-a-number").is_err());
        assert!("@g.us".parse::<Jid>().is_err());
        assert!("user@".parse::<Jid>().is_err());
    }
}
