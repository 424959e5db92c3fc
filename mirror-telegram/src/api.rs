//! Bot API wire types and their mapping onto engine types.

use mirror_engine::{
    ChatId, EventKind, InboundEvent, MediaDescriptor, MediaKind, MessageId, MessageRef, Payload,
    TextEntity, TransportError,
};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Used when a 429 arrives without `parameters.retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

const NOT_MODIFIED_MARKER: &str = "message is not modified";
const CONTENT_UNAVAILABLE_MARKERS: [&str; 5] = [
    "file is too big",
    "file not found",
    "wrong file_id",
    "wrong file identifier",
    "invalid file_id",
];

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse<T> {
    #[serde(default)]
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub error_code: Option<u16>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseParameters {
    #[serde(default)]
    pub retry_after: Option<u64>,
}

impl<T> ApiResponse<T> {
    /// Splits a decoded response into its result or a classified error.
    pub fn into_result(self, status: StatusCode) -> Result<T, TransportError> {
        if self.ok {
            if let Some(result) = self.result {
                return Ok(result);
            }
        }
        let code = self
            .error_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(status);
        Err(classify(
            code,
            self.description.as_deref().unwrap_or_default(),
            self.parameters.and_then(|p| p.retry_after),
        ))
    }
}

/// Maps a failed Bot API call onto the transport error taxonomy.
pub fn classify(status: StatusCode, description: &str, retry_after: Option<u64>) -> TransportError {
    let lowered = description.to_ascii_lowercase();
    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited {
            retry_after: retry_after
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER),
        },
        StatusCode::FORBIDDEN => TransportError::Forbidden(description.to_string()),
        StatusCode::BAD_REQUEST if lowered.contains(NOT_MODIFIED_MARKER) => {
            TransportError::NotModified
        }
        StatusCode::BAD_REQUEST
            if CONTENT_UNAVAILABLE_MARKERS
                .iter()
                .any(|marker| lowered.contains(marker)) =>
        {
            TransportError::ContentUnavailable(description.to_string())
        }
        StatusCode::NOT_FOUND if lowered.contains("file") => {
            TransportError::ContentUnavailable(description.to_string())
        }
        status if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() => {
            TransportError::Transient(format!("status={status} {description}"))
        }
        status => TransportError::Rejected(format!("status={status} {description}")),
    }
}

pub(crate) fn network_error(error: reqwest::Error) -> TransportError {
    TransportError::Transient(error.to_string())
}

#[derive(Debug, Deserialize)]
pub(crate) struct SentMessage {
    pub message_id: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileInfo {
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_message: Option<TelegramMessage>,
    #[serde(default)]
    pub channel_post: Option<TelegramMessage>,
    #[serde(default)]
    pub edited_channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub entities: Vec<TextEntity>,
    #[serde(default)]
    pub caption_entities: Vec<TextEntity>,
    #[serde(default)]
    pub link_preview_options: Option<LinkPreviewOptions>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub has_protected_content: bool,
    #[serde(default)]
    pub photo: Vec<TelegramFile>,
    #[serde(default)]
    pub video: Option<TelegramFile>,
    #[serde(default)]
    pub audio: Option<TelegramFile>,
    #[serde(default)]
    pub voice: Option<TelegramFile>,
    #[serde(default)]
    pub video_note: Option<TelegramFile>,
    #[serde(default)]
    pub animation: Option<TelegramFile>,
    #[serde(default)]
    pub sticker: Option<TelegramFile>,
    #[serde(default)]
    pub document: Option<TelegramFile>,
    #[serde(default)]
    pub poll: Option<TelegramPoll>,
    #[serde(default)]
    pub location: Option<TelegramLocation>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LinkPreviewOptions {
    #[serde(default)]
    pub is_disabled: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramChat {
    pub id: i64,
}

/// Shared shape of every downloadable attachment.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Video notes are square and report a single dimension.
    #[serde(default)]
    pub length: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramPoll {
    pub question: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TelegramLocation {
    pub latitude: f64,
    pub longitude: f64,
}

impl TelegramFile {
    fn describe(&self, kind: MediaKind) -> MediaDescriptor {
        MediaDescriptor {
            kind,
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
            size: self.file_size,
            duration: self.duration,
            width: self.width.or(self.length),
            height: self.height.or(self.length),
        }
    }
}

impl TelegramMessage {
    fn media(&self) -> Option<MediaDescriptor> {
        // The last photo size is the largest rendition.
        if let Some(photo) = self.photo.last() {
            return Some(photo.describe(MediaKind::Photo));
        }
        let candidates = [
            (&self.video, MediaKind::Video),
            (&self.animation, MediaKind::Animation),
            (&self.audio, MediaKind::Audio),
            (&self.voice, MediaKind::Voice),
            (&self.video_note, MediaKind::VideoNote),
            (&self.sticker, MediaKind::Sticker),
            (&self.document, MediaKind::Document),
        ];
        candidates
            .into_iter()
            .find_map(|(file, kind)| file.as_ref().map(|file| file.describe(kind)))
    }

    fn payload(&self) -> Option<Payload> {
        if let Some(media) = self.media() {
            let caption = self.caption.clone().filter(|c| !c.trim().is_empty());
            let entities = if caption.is_some() {
                self.caption_entities.clone()
            } else {
                Vec::new()
            };
            return Some(Payload::Media {
                media,
                caption,
                entities,
            });
        }
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(Payload::Text {
                text: text.to_string(),
                entities: self.entities.clone(),
                link_preview: !self
                    .link_preview_options
                    .as_ref()
                    .is_some_and(|options| options.is_disabled),
            });
        }
        if let Some(poll) = &self.poll {
            return Some(Payload::Poll {
                question: poll.question.clone(),
            });
        }
        self.location.as_ref().map(|location| Payload::Location {
            latitude: location.latitude,
            longitude: location.longitude,
        })
    }
}

/// Converts one update into an engine event. Service messages (joins, pins,
/// title changes) carry no mirrorable payload and yield `None`.
pub(crate) fn build_inbound_event(update: &TelegramUpdate) -> Option<InboundEvent> {
    let (message, edited) = match (
        &update.message,
        &update.channel_post,
        &update.edited_message,
        &update.edited_channel_post,
    ) {
        (Some(message), _, _, _) | (_, Some(message), _, _) => (message, false),
        (_, _, Some(message), _) | (_, _, _, Some(message)) => (message, true),
        _ => return None,
    };

    let payload = message.payload()?;
    let kind = match (edited, message.media_group_id.is_some()) {
        (true, _) => EventKind::Edit,
        (false, true) => EventKind::AlbumPart,
        (false, false) => EventKind::New,
    };
    let mut event = InboundEvent::new(
        kind,
        MessageRef::new(
            ChatId::new(message.chat.id),
            MessageId::new(message.message_id),
        ),
        payload,
    );
    event.is_protected = message.has_protected_content;
    event.media_group = message.media_group_id.clone();
    Some(event)
}
