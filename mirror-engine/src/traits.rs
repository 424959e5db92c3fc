use crate::config::MirrorOptions;
use crate::error::{Result, TransportResult};
use crate::snapshot::EngineSnapshot;
use crate::types::{ChatId, FormattedText, MediaDescriptor, MessageId, MessageRef};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub type ByteStream = BoxStream<'static, TransportResult<Bytes>>;

/// Content of an edit, applied against an already-mirrored message.
#[derive(Debug, Clone, PartialEq)]
pub enum EditContent {
    Text(FormattedText),
    /// `None` clears the caption.
    Caption(Option<FormattedText>),
}

/// A fully-fetched media item ready for re-publication.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub media: MediaDescriptor,
    pub caption: Option<FormattedText>,
    pub data: Bytes,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Short identifier for logs: "telegram", "memory".
    fn transport_id(&self) -> &str;

    /// Relay the source item by reference, without fetching its content.
    async fn relay(&self, target: ChatId, source: MessageRef) -> TransportResult<MessageId>;

    /// Relay several messages of one source chat as a single media group.
    /// `messages` is strictly increasing; returned ids follow the same order.
    async fn relay_group(
        &self,
        target: ChatId,
        source_chat: ChatId,
        messages: &[MessageId],
    ) -> TransportResult<Vec<MessageId>>;

    async fn send_text(&self, target: ChatId, text: &FormattedText) -> TransportResult<MessageId>;

    /// Publish fetched media as new content.
    async fn send_media(&self, target: ChatId, upload: MediaUpload) -> TransportResult<MessageId>;

    /// Publish media from a chunked stream without buffering it whole.
    async fn send_media_stream(
        &self,
        target: ChatId,
        media: &MediaDescriptor,
        caption: Option<&FormattedText>,
        body: ByteStream,
    ) -> TransportResult<MessageId>;

    async fn edit(
        &self,
        target: ChatId,
        message: MessageId,
        content: &EditContent,
    ) -> TransportResult<()>;

    async fn delete(&self, target: ChatId, message: MessageId) -> TransportResult<()>;

    async fn fetch(&self, source: MessageRef, media: &MediaDescriptor) -> TransportResult<Bytes>;

    async fn fetch_stream(
        &self,
        source: MessageRef,
        media: &MediaDescriptor,
    ) -> TransportResult<ByteStream>;

    /// Size lookup for media whose size was unknown at intake.
    /// Transports that cannot tell keep the default.
    async fn content_size(
        &self,
        _source: MessageRef,
        _media: &MediaDescriptor,
    ) -> TransportResult<Option<u64>> {
        Ok(None)
    }
}

/// Configuration collaborator: owns the channel mapping table and toggles.
/// The engine only reads mappings; removals go through `report_invalid_mapping`.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    fn target_for(&self, source: ChatId) -> Option<ChatId>;

    fn mapping_count(&self) -> usize;

    fn options(&self) -> MirrorOptions;

    async fn report_invalid_mapping(
        &self,
        source: ChatId,
        target: ChatId,
        reason: &str,
    ) -> Result<()>;

    async fn load_snapshot(&self) -> Result<Option<EngineSnapshot>>;

    async fn save_snapshot(&self, snapshot: &EngineSnapshot) -> Result<()>;
}
