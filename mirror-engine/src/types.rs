use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(ChatId);
id_newtype!(MessageId);

/// Address of a message on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl MessageRef {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self {
            chat_id,
            message_id,
        }
    }

    /// Persisted key layout: `"{chat_id}_{message_id}"`.
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.chat_id, self.message_id)
    }

    pub fn parse_cache_key(key: &str) -> Option<Self> {
        // Chat ids may be negative, so split on the last underscore.
        let (chat, message) = key.rsplit_once('_')?;
        Some(Self::new(
            ChatId::new(chat.parse().ok()?),
            MessageId::new(message.parse().ok()?),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    New,
    Edit,
    Delete,
    AlbumPart,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal = 0,
    High = 1,
    Critical = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Voice,
    VideoNote,
    Animation,
    Sticker,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::VideoNote => "video_note",
            Self::Animation => "animation",
            Self::Sticker => "sticker",
            Self::Document => "document",
        }
    }
}

/// Source-side description of a media attachment. Everything needed to
/// re-publish the media with its original attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub kind: MediaKind,
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Size in bytes, when the platform reports it up front.
    #[serde(default)]
    pub size: Option<u64>,
    /// Seconds, for audio/video/voice.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// One formatting span (bold, link, code, mention). Offsets and lengths are
/// UTF-16 code units, the way the platform counts them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextEntity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    /// Kind-specific fields such as `url`, `language`, or `user`.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TextEntity {
    fn shifted(&self, by: usize) -> Self {
        Self {
            offset: self.offset + by,
            ..self.clone()
        }
    }
}

/// Text as it is re-published: content, formatting, and preview preference.
#[derive(Debug, Clone, PartialEq)]
pub struct FormattedText {
    pub text: String,
    pub entities: Vec<TextEntity>,
    /// False when the source message had link previews switched off.
    pub link_preview: bool,
}

impl FormattedText {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entities: Vec::new(),
            link_preview: true,
        }
    }

    /// Concatenates texts with `separator`. Each part's entities are shifted
    /// past everything before it; previews stay on only if every part allows them.
    pub fn join<'a>(parts: impl IntoIterator<Item = &'a FormattedText>, separator: &str) -> Self {
        let mut joined = Self::plain(String::new());
        for (index, part) in parts.into_iter().enumerate() {
            if index > 0 {
                joined.text.push_str(separator);
            }
            let base = utf16_len(&joined.text);
            joined.text.push_str(&part.text);
            joined
                .entities
                .extend(part.entities.iter().map(|entity| entity.shifted(base)));
            joined.link_preview &= part.link_preview;
        }
        joined
    }
}

pub fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text {
        text: String,
        entities: Vec<TextEntity>,
        link_preview: bool,
    },
    Media {
        media: MediaDescriptor,
        caption: Option<String>,
        entities: Vec<TextEntity>,
    },
    Poll {
        question: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    /// Aggregated small text items, in arrival order.
    Batch {
        parts: Vec<MirrorTask>,
    },
    /// Parts of one source album, relayed together as a media group in
    /// source message order.
    Album {
        parts: Vec<MirrorTask>,
    },
    /// DELETE carries no content.
    Empty,
}

impl Payload {
    pub fn plain_text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            entities: Vec::new(),
            link_preview: true,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text { text, .. } => Some(text),
            Self::Media { caption, .. } => caption.as_deref(),
            _ => None,
        }
    }

    /// Text or caption together with its formatting.
    pub fn formatted(&self) -> Option<FormattedText> {
        match self {
            Self::Text {
                text,
                entities,
                link_preview,
            } => Some(FormattedText {
                text: text.clone(),
                entities: entities.clone(),
                link_preview: *link_preview,
            }),
            Self::Media {
                caption: Some(caption),
                entities,
                ..
            } => Some(FormattedText {
                text: caption.clone(),
                entities: entities.clone(),
                link_preview: false,
            }),
            _ => None,
        }
    }

    pub fn media(&self) -> Option<&MediaDescriptor> {
        match self {
            Self::Media { media, .. } => Some(media),
            _ => None,
        }
    }

    /// Constituent tasks of an aggregated payload.
    pub fn parts(&self) -> Option<&[MirrorTask]> {
        match self {
            Self::Batch { parts } | Self::Album { parts } => Some(parts),
            _ => None,
        }
    }

    pub fn parts_mut(&mut self) -> Option<&mut Vec<MirrorTask>> {
        match self {
            Self::Batch { parts } | Self::Album { parts } => Some(parts),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Media { .. } => "media",
            Self::Poll { .. } => "poll",
            Self::Location { .. } => "location",
            Self::Batch { .. } => "batch",
            Self::Album { .. } => "album",
            Self::Empty => "empty",
        }
    }
}

/// A unit of pending outbound work derived from one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorTask {
    pub id: Uuid,
    pub source_chat_id: ChatId,
    pub source_message_id: MessageId,
    pub kind: TaskKind,
    pub priority: Priority,
    pub payload: Payload,
    pub is_protected: bool,
    pub target_chat_id: ChatId,
    /// Ordering key within a priority tier. Retries keep it.
    pub enqueued_at: Instant,
    /// Earliest dispatch time after a reschedule.
    pub not_before: Option<Instant>,
    pub attempt_count: u32,
    pub throttled_count: u32,
    /// Cleared on tasks decomposed out of a failed batch.
    pub batchable: bool,
    /// False when the payload no longer matches the source item (media
    /// stripped down to its caption), so it cannot be relayed by reference.
    pub relayable: bool,
    /// Source album this part belongs to.
    pub media_group: Option<String>,
}

impl MirrorTask {
    pub fn new(
        source: MessageRef,
        kind: TaskKind,
        priority: Priority,
        payload: Payload,
        target_chat_id: ChatId,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_chat_id: source.chat_id,
            source_message_id: source.message_id,
            kind,
            priority,
            payload,
            is_protected: false,
            target_chat_id,
            enqueued_at: Instant::now(),
            not_before: None,
            attempt_count: 0,
            throttled_count: 0,
            batchable: true,
            relayable: true,
            media_group: None,
        }
    }

    pub fn protected(mut self, is_protected: bool) -> Self {
        self.is_protected = is_protected;
        self
    }

    pub fn source(&self) -> MessageRef {
        MessageRef::new(self.source_chat_id, self.source_message_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    New,
    Edit,
    Delete,
    AlbumPart,
}

impl From<EventKind> for TaskKind {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::New => Self::New,
            EventKind::Edit => Self::Edit,
            EventKind::Delete => Self::Delete,
            EventKind::AlbumPart => Self::AlbumPart,
        }
    }
}

/// A discrete content-change event pushed by an intake source.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub source: MessageRef,
    pub payload: Payload,
    pub is_protected: bool,
    /// Intake sources may escalate; defaults to normal.
    pub priority: Option<Priority>,
    pub media_group: Option<String>,
}

impl InboundEvent {
    pub fn new(kind: EventKind, source: MessageRef, payload: Payload) -> Self {
        Self {
            kind,
            source,
            payload,
            is_protected: false,
            priority: None,
            media_group: None,
        }
    }

    pub fn delete(source: MessageRef) -> Self {
        Self::new(EventKind::Delete, source, Payload::Empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_round_trips_negative_chat_ids() {
        let source = MessageRef::new(ChatId::new(-1001234567890), MessageId::new(42));
        assert_eq!(source.cache_key(), "-1001234567890_42");
        assert_eq!(MessageRef::parse_cache_key(&source.cache_key()), Some(source));
        assert_eq!(MessageRef::parse_cache_key("garbage"), None);
    }

    fn entity(kind: &str, offset: usize, length: usize) -> TextEntity {
        TextEntity {
            kind: kind.to_string(),
            offset,
            length,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn join_shifts_entities_by_utf16_length() {
        let first = FormattedText {
            text: "héllo 👋".to_string(),
            entities: vec![entity("bold", 0, 5)],
            link_preview: true,
        };
        let second = FormattedText {
            text: "see docs".to_string(),
            entities: vec![entity("italic", 4, 4)],
            link_preview: false,
        };
        let joined = FormattedText::join([&first, &second], "\n\n");

        assert_eq!(joined.text, "héllo 👋\n\nsee docs");
        // The emoji is two UTF-16 units: 8 units of text plus 2 of separator.
        assert_eq!(joined.entities[0], entity("bold", 0, 5));
        assert_eq!(joined.entities[1], entity("italic", 14, 4));
        assert!(!joined.link_preview);
    }

    #[test]
    fn entity_keeps_kind_specific_fields() {
        let link: TextEntity = serde_json::from_value(serde_json::json!({
            "type": "text_link",
            "offset": 2,
            "length": 3,
            "url": "https://example.org"
        }))
        .expect("decode entity");
        assert_eq!(link.kind, "text_link");
        assert_eq!(link.extra["url"], "https://example.org");
        let encoded = serde_json::to_value(&link).expect("encode entity");
        assert_eq!(encoded["type"], "text_link");
        assert_eq!(encoded["url"], "https://example.org");
    }

    #[test]
    fn priorities_order_critical_first() {
        let mut priorities = vec![Priority::Normal, Priority::Critical, Priority::High];
        priorities.sort_by(|a, b| b.cmp(a));
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Normal]
        );
    }
}
