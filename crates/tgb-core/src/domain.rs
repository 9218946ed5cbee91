use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub i64);

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
    pub fn next(self) -> Self {
        MessageId(self.0 + 1)
    }
}

macro_rules! numeric_id {
    ($ty:ident, $what:literal) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.trim()
                    .parse::<i64>()
                    .map($ty)
                    .map_err(|e| Error::Parse(format!("invalid {} {s:?}: {e}", $what)))
            }
        }
    };
}

numeric_id!(ChatId, "chat id");
numeric_id!(UserId, "user id");
numeric_id!(MessageId, "message id");

impl From<UserId> for ChatId {
    /// A user's direct (private) chat shares the user's id.
    fn from(u: UserId) -> Self {
        ChatId(u.0)
    }
}

/// Addresses a recipient either by numeric id or by public `@username`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChatRef {
    Id(ChatId),
    Username(String),
}

impl ChatRef {
    /// Build a username reference; a leading `@` is accepted and stripped.
    pub fn username(name: impl AsRef<str>) -> Self {
        ChatRef::Username(name.as_ref().trim_start_matches('@').to_string())
    }
}

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatRef::Id(id) => write!(f, "{id}"),
            ChatRef::Username(name) => write!(f, "@{name}"),
        }
    }
}

impl FromStr for ChatRef {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix('@') {
            if name.is_empty() {
                return Err(Error::Parse("empty chat username".to_string()));
            }
            return Ok(ChatRef::Username(name.to_string()));
        }
        s.parse::<ChatId>().map(ChatRef::Id)
    }
}

impl From<ChatId> for ChatRef {
    fn from(id: ChatId) -> Self {
        ChatRef::Id(id)
    }
}

impl From<UserId> for ChatRef {
    fn from(id: UserId) -> Self {
        ChatRef::Id(id.into())
    }
}

impl Serialize for ChatRef {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ChatRef::Id(id) => s.serialize_i64(id.0),
            ChatRef::Username(_) => s.collect_str(self),
        }
    }
}

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Subscription id: an item id and a kind scoped to the chat that owns it.
///
/// String form is `{id}+{kind}+{chat_id}`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubId {
    pub id: String,
    pub kind: String,
    pub chat_id: ChatId,
}

const SUB_ID_SEPARATOR: char = '+';

impl SubId {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, chat_id: ChatId) -> Result<Self> {
        let sub = SubId {
            id: id.into(),
            kind: kind.into(),
            chat_id,
        };
        for part in [&sub.id, &sub.kind] {
            if part.is_empty() || part.contains(SUB_ID_SEPARATOR) {
                return Err(Error::InvalidSubId(format!(
                    "part {part:?} must be non-empty and must not contain '{SUB_ID_SEPARATOR}'"
                )));
            }
        }
        Ok(sub)
    }
}

impl fmt::Display for SubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SUB_ID_SEPARATOR}{}{SUB_ID_SEPARATOR}{}",
            self.id, self.kind, self.chat_id
        )
    }
}

impl FromStr for SubId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(SUB_ID_SEPARATOR).collect();
        let [id, kind, chat_id] = parts.as_slice() else {
            return Err(Error::InvalidSubId(format!(
                "{s:?}: expected 3 parts, got {}",
                parts.len()
            )));
        };
        let chat_id = chat_id
            .parse::<ChatId>()
            .map_err(|e| Error::InvalidSubId(format!("{s:?}: {e}")))?;
        SubId::new(*id, *kind, chat_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_strings() {
        for v in [0, 1, -1, 42, -1001234567890, i64::MAX, i64::MIN] {
            let id = ChatId(v);
            assert_eq!(id.to_string().parse::<ChatId>().unwrap(), id);
        }
        assert!("12a".parse::<ChatId>().is_err());
    }

    #[test]
    fn message_id_successor() {
        assert_eq!(MessageId(41).next(), MessageId(42));
    }

    #[test]
    fn chat_ref_display_and_parse() {
        let by_name = ChatRef::username("@news");
        assert_eq!(by_name.to_string(), "@news");
        assert_eq!("@news".parse::<ChatRef>().unwrap(), by_name);
        assert_eq!(
            "-100500".parse::<ChatRef>().unwrap(),
            ChatRef::Id(ChatId(-100500))
        );
        assert!("@".parse::<ChatRef>().is_err());
    }

    #[test]
    fn chat_ref_serializes_as_form_value() {
        assert_eq!(
            serde_json::to_value(ChatRef::Id(ChatId(7))).unwrap(),
            serde_json::json!(7)
        );
        assert_eq!(
            serde_json::to_value(ChatRef::username("chan")).unwrap(),
            serde_json::json!("@chan")
        );
    }

    #[test]
    fn sub_id_round_trip() {
        let sub = SubId::new("t3_abc", "reddit", ChatId(-100123)).unwrap();
        assert_eq!(sub.to_string(), "t3_abc+reddit+-100123");
        assert_eq!(sub.to_string().parse::<SubId>().unwrap(), sub);
    }

    #[test]
    fn sub_id_rejects_malformed_input() {
        for bad in ["", "a+b", "a+b+c+d", "a++1", "+b+1", "a+b+x"] {
            let err = bad.parse::<SubId>().unwrap_err();
            assert!(matches!(err, Error::InvalidSubId(_)), "{bad}: {err}");
        }
        assert!(SubId::new("a+b", "k", ChatId(1)).is_err());
    }
}
