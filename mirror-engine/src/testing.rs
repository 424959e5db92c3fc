//! In-memory collaborators for unit tests.

use crate::config::MirrorOptions;
use crate::error::{Result, TransportError, TransportResult};
use crate::snapshot::EngineSnapshot;
use crate::traits::{ByteStream, EditContent, MediaUpload, SettingsStore, Transport};
use crate::types::{ChatId, FormattedText, MediaDescriptor, MessageId, MessageRef, TextEntity};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Relay { target: ChatId, source: MessageRef },
    RelayGroup { target: ChatId, sources: Vec<MessageRef> },
    SendText { target: ChatId, text: String },
    SendMedia { target: ChatId, bytes: usize },
    SendStream { target: ChatId, bytes: usize },
    Edit { target: ChatId, message: MessageId, content: EditContent },
    Delete { target: ChatId, message: MessageId },
    Fetch { source: MessageRef },
    FetchStream { source: MessageRef },
}

impl Call {
    pub fn is_outbound(&self) -> bool {
        !matches!(self, Self::Fetch { .. } | Self::FetchStream { .. })
    }
}

/// Records every call. Outbound calls pop scripted failures first.
#[derive(Debug)]
pub struct MemoryTransport {
    calls: Mutex<Vec<Call>>,
    sent_formatting: Mutex<Vec<Vec<TextEntity>>>,
    failures: Mutex<VecDeque<TransportError>>,
    fetch_failure: Mutex<Option<TransportError>>,
    next_message_id: AtomicI64,
    content: Bytes,
    size: Option<u64>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            sent_formatting: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            fetch_failure: Mutex::new(None),
            next_message_id: AtomicI64::new(1000),
            content: Bytes::from_static(b"media-bytes"),
            size: None,
        }
    }
}

impl MemoryTransport {
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().expect("lock").push_back(error);
    }

    pub fn fail_fetch(&self, error: TransportError) {
        *self.fetch_failure.lock().expect("lock") = Some(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock").clone()
    }

    pub fn outbound(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_outbound).collect()
    }

    /// Formatting of every text send, in call order.
    pub fn sent_entities(&self) -> Vec<Vec<TextEntity>> {
        self.sent_formatting.lock().expect("lock").clone()
    }

    fn outbound_call(&self, call: Call) -> TransportResult<MessageId> {
        self.calls.lock().expect("lock").push(call);
        if let Some(error) = self.failures.lock().expect("lock").pop_front() {
            return Err(error);
        }
        Ok(MessageId::new(
            self.next_message_id.fetch_add(1, Ordering::SeqCst),
        ))
    }

    fn fetch_call(&self, call: Call) -> TransportResult<()> {
        self.calls.lock().expect("lock").push(call);
        match self.fetch_failure.lock().expect("lock").clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn transport_id(&self) -> &str {
        "memory"
    }

    async fn relay(&self, target: ChatId, source: MessageRef) -> TransportResult<MessageId> {
        self.outbound_call(Call::Relay { target, source })
    }

    async fn relay_group(
        &self,
        target: ChatId,
        source_chat: ChatId,
        messages: &[MessageId],
    ) -> TransportResult<Vec<MessageId>> {
        let first = self.outbound_call(Call::RelayGroup {
            target,
            sources: messages
                .iter()
                .map(|message| MessageRef::new(source_chat, *message))
                .collect(),
        })?;
        let rest = messages.len().saturating_sub(1) as i64;
        self.next_message_id.fetch_add(rest, Ordering::SeqCst);
        Ok((0..messages.len() as i64)
            .map(|offset| MessageId::new(first.get() + offset))
            .collect())
    }

    async fn send_text(&self, target: ChatId, text: &FormattedText) -> TransportResult<MessageId> {
        self.sent_formatting
            .lock()
            .expect("lock")
            .push(text.entities.clone());
        self.outbound_call(Call::SendText {
            target,
            text: text.text.clone(),
        })
    }

    async fn send_media(&self, target: ChatId, upload: MediaUpload) -> TransportResult<MessageId> {
        self.outbound_call(Call::SendMedia {
            target,
            bytes: upload.data.len(),
        })
    }

    async fn send_media_stream(
        &self,
        target: ChatId,
        _media: &MediaDescriptor,
        _caption: Option<&FormattedText>,
        mut body: ByteStream,
    ) -> TransportResult<MessageId> {
        let mut bytes = 0;
        while let Some(chunk) = body.next().await {
            bytes += chunk?.len();
        }
        self.outbound_call(Call::SendStream { target, bytes })
    }

    async fn edit(
        &self,
        target: ChatId,
        message: MessageId,
        content: &EditContent,
    ) -> TransportResult<()> {
        self.outbound_call(Call::Edit {
            target,
            message,
            content: content.clone(),
        })
        .map(|_| ())
    }

    async fn delete(&self, target: ChatId, message: MessageId) -> TransportResult<()> {
        self.outbound_call(Call::Delete { target, message })
            .map(|_| ())
    }

    async fn fetch(&self, source: MessageRef, _media: &MediaDescriptor) -> TransportResult<Bytes> {
        self.fetch_call(Call::Fetch { source })?;
        Ok(self.content.clone())
    }

    async fn fetch_stream(
        &self,
        source: MessageRef,
        _media: &MediaDescriptor,
    ) -> TransportResult<ByteStream> {
        self.fetch_call(Call::FetchStream { source })?;
        let chunks: Vec<TransportResult<Bytes>> = self
            .content
            .chunks(4)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn content_size(
        &self,
        _source: MessageRef,
        _media: &MediaDescriptor,
    ) -> TransportResult<Option<u64>> {
        Ok(self.size)
    }
}

#[derive(Debug, Default)]
pub struct MemorySettings {
    mappings: DashMap<ChatId, ChatId>,
    options: Mutex<MirrorOptions>,
    invalid: Mutex<Vec<(ChatId, ChatId, String)>>,
    snapshot: Mutex<Option<EngineSnapshot>>,
}

impl MemorySettings {
    pub fn with_mapping(source: i64, target: i64) -> Self {
        let settings = Self::default();
        settings.map(source, target);
        settings
    }

    pub fn map(&self, source: i64, target: i64) {
        self.mappings
            .insert(ChatId::new(source), ChatId::new(target));
    }

    pub fn unmap(&self, source: i64) {
        self.mappings.remove(&ChatId::new(source));
    }

    pub fn set_options(&self, options: MirrorOptions) {
        *self.options.lock().expect("lock") = options;
    }

    pub fn invalid_reports(&self) -> Vec<(ChatId, ChatId, String)> {
        self.invalid.lock().expect("lock").clone()
    }

    pub fn saved_snapshot(&self) -> Option<EngineSnapshot> {
        self.snapshot.lock().expect("lock").clone()
    }
}

#[async_trait]
impl SettingsStore for MemorySettings {
    fn target_for(&self, source: ChatId) -> Option<ChatId> {
        self.mappings.get(&source).map(|target| *target)
    }

    fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    fn options(&self) -> MirrorOptions {
        *self.options.lock().expect("lock")
    }

    async fn report_invalid_mapping(
        &self,
        source: ChatId,
        target: ChatId,
        reason: &str,
    ) -> Result<()> {
        self.mappings.remove(&source);
        self.invalid
            .lock()
            .expect("lock")
            .push((source, target, reason.to_string()));
        Ok(())
    }

    async fn load_snapshot(&self) -> Result<Option<EngineSnapshot>> {
        Ok(self.snapshot.lock().expect("lock").clone())
    }

    async fn save_snapshot(&self, snapshot: &EngineSnapshot) -> Result<()> {
        *self.snapshot.lock().expect("lock") = Some(snapshot.clone());
        Ok(())
    }
}
