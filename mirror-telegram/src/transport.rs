use crate::api::{self, ApiResponse, FileInfo, SentMessage};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt};
use mirror_engine::{
    ByteStream, ChatId, EditContent, FormattedText, MediaDescriptor, MediaKind, MediaUpload,
    MessageId, MessageRef, Transport, TransportError, TransportResult,
};
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_TRANSPORT_ID: &str = "telegram";
const TELEGRAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Bot API client used for both sending and reading source content.
#[derive(Clone)]
pub struct TelegramTransport {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
}

impl TelegramTransport {
    pub fn new(bot_token: &str) -> anyhow::Result<Self> {
        Self::with_api_base(bot_token, TELEGRAM_API_BASE)
    }

    /// Points the client at a self-hosted Bot API server.
    pub fn with_api_base(bot_token: &str, api_base: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(TELEGRAM_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn api_url(&self, method: &str) -> TransportResult<Url> {
        Url::parse(&format!("{}/bot{}/{}", self.api_base, self.bot_token, method))
            .map_err(|e| TransportError::Rejected(format!("invalid api url: {e}")))
    }

    fn file_url(&self, file_path: &str) -> TransportResult<Url> {
        Url::parse(&format!(
            "{}/file/bot{}/{}",
            self.api_base, self.bot_token, file_path
        ))
        .map_err(|e| TransportError::Rejected(format!("invalid file url: {e}")))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> TransportResult<T> {
        let response = self
            .http
            .post(self.api_url(method)?)
            .json(body)
            .send()
            .await
            .map_err(api::network_error)?;
        decode(response).await
    }

    async fn call_multipart<T: DeserializeOwned>(
        &self,
        method: &str,
        form: Form,
    ) -> TransportResult<T> {
        let response = self
            .http
            .post(self.api_url(method)?)
            .multipart(form)
            .send()
            .await
            .map_err(api::network_error)?;
        decode(response).await
    }

    async fn file_path(&self, media: &MediaDescriptor) -> TransportResult<FileInfo> {
        self.call("getFile", &serde_json::json!({ "file_id": media.file_id }))
            .await
    }

    async fn download(&self, media: &MediaDescriptor) -> TransportResult<reqwest::Response> {
        let info = self.file_path(media).await?;
        let Some(path) = info.file_path else {
            return Err(TransportError::ContentUnavailable(format!(
                "no file path for {}",
                media.file_id
            )));
        };
        let response = self
            .http
            .get(self.file_url(&path)?)
            .send()
            .await
            .map_err(api::network_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::NOT_FOUND => TransportError::ContentUnavailable(body),
                status => api::classify(status, &body, None),
            });
        }
        Ok(response)
    }

    async fn send_upload(
        &self,
        target: ChatId,
        media: &MediaDescriptor,
        caption: Option<&FormattedText>,
        part: Part,
    ) -> TransportResult<MessageId> {
        let part = match &media.mime_type {
            Some(mime) => part
                .mime_str(mime)
                .map_err(|e| TransportError::Rejected(format!("invalid mime type: {e}")))?,
            None => part,
        };
        let field = upload_field(media.kind);
        let mut form = Form::new()
            .text("chat_id", target.to_string())
            .part(field, part.file_name(upload_file_name(media)));
        if let Some(caption) = caption {
            form = form.text("caption", caption.text.clone());
            if !caption.entities.is_empty() {
                let entities = serde_json::to_string(&caption.entities)
                    .map_err(|e| TransportError::Rejected(format!("encode caption entities: {e}")))?;
                form = form.text("caption_entities", entities);
            }
        }
        for (name, value) in [
            ("duration", media.duration),
            ("width", media.width),
            ("height", media.height),
        ] {
            // Telegram rejects these attributes on uploads that don't carry them.
            if let Some(value) = value.filter(|_| accepts_dimensions(media.kind, name)) {
                form = form.text(name, value.to_string());
            }
        }
        let sent: SentMessage = self.call_multipart(upload_method(media.kind), form).await?;
        Ok(MessageId::new(sent.message_id))
    }
}

/// Body for `sendMessage` and `editMessageText`: text plus its formatting.
fn text_body(target: ChatId, message: Option<MessageId>, text: &FormattedText) -> serde_json::Value {
    let mut body = serde_json::json!({ "chat_id": target.get(), "text": text.text });
    if let Some(message) = message {
        body["message_id"] = serde_json::json!(message.get());
    }
    if !text.entities.is_empty() {
        body["entities"] = serde_json::json!(text.entities);
    }
    if !text.link_preview {
        body["link_preview_options"] = serde_json::json!({ "is_disabled": true });
    }
    body
}

fn caption_body(
    target: ChatId,
    message: MessageId,
    caption: Option<&FormattedText>,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": target.get(),
        "message_id": message.get(),
        "caption": caption.map_or("", |caption| caption.text.as_str()),
    });
    if let Some(caption) = caption.filter(|caption| !caption.entities.is_empty()) {
        body["caption_entities"] = serde_json::json!(caption.entities);
    }
    body
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> TransportResult<T> {
    let status = response.status();
    let body = response.bytes().await.map_err(api::network_error)?;
    match serde_json::from_slice::<ApiResponse<T>>(&body) {
        Ok(parsed) => parsed.into_result(status),
        Err(error) if status.is_success() => Err(TransportError::Transient(format!(
            "undecodable telegram response: {error}"
        ))),
        Err(_) => Err(api::classify(
            status,
            &String::from_utf8_lossy(&body),
            None,
        )),
    }
}

fn upload_method(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "sendPhoto",
        MediaKind::Video => "sendVideo",
        MediaKind::Audio => "sendAudio",
        MediaKind::Voice => "sendVoice",
        MediaKind::VideoNote => "sendVideoNote",
        MediaKind::Animation => "sendAnimation",
        MediaKind::Sticker => "sendSticker",
        MediaKind::Document => "sendDocument",
    }
}

fn upload_field(kind: MediaKind) -> &'static str {
    kind.as_str()
}

fn upload_file_name(media: &MediaDescriptor) -> String {
    if let Some(name) = media.file_name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let extension = match media.kind {
        MediaKind::Photo => "jpg",
        MediaKind::Video | MediaKind::VideoNote | MediaKind::Animation => "mp4",
        MediaKind::Audio => "mp3",
        MediaKind::Voice => "ogg",
        MediaKind::Sticker => "webp",
        MediaKind::Document => "bin",
    };
    format!("{}.{extension}", media.kind.as_str())
}

fn accepts_dimensions(kind: MediaKind, attribute: &str) -> bool {
    match attribute {
        "duration" => matches!(
            kind,
            MediaKind::Video
                | MediaKind::Audio
                | MediaKind::Voice
                | MediaKind::VideoNote
                | MediaKind::Animation
        ),
        "width" | "height" => matches!(kind, MediaKind::Video | MediaKind::Animation),
        _ => false,
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    fn transport_id(&self) -> &str {
        TELEGRAM_TRANSPORT_ID
    }

    async fn relay(&self, target: ChatId, source: MessageRef) -> TransportResult<MessageId> {
        let copied: SentMessage = self
            .call(
                "copyMessage",
                &serde_json::json!({
                    "chat_id": target.get(),
                    "from_chat_id": source.chat_id.get(),
                    "message_id": source.message_id.get(),
                }),
            )
            .await?;
        Ok(MessageId::new(copied.message_id))
    }

    async fn relay_group(
        &self,
        target: ChatId,
        source_chat: ChatId,
        messages: &[MessageId],
    ) -> TransportResult<Vec<MessageId>> {
        let message_ids: Vec<i64> = messages.iter().map(|message| message.get()).collect();
        let copied: Vec<SentMessage> = self
            .call(
                "copyMessages",
                &serde_json::json!({
                    "chat_id": target.get(),
                    "from_chat_id": source_chat.get(),
                    "message_ids": message_ids,
                }),
            )
            .await?;
        Ok(copied
            .into_iter()
            .map(|copied| MessageId::new(copied.message_id))
            .collect())
    }

    async fn send_text(&self, target: ChatId, text: &FormattedText) -> TransportResult<MessageId> {
        let sent: SentMessage = self
            .call("sendMessage", &text_body(target, None, text))
            .await?;
        Ok(MessageId::new(sent.message_id))
    }

    async fn send_media(&self, target: ChatId, upload: MediaUpload) -> TransportResult<MessageId> {
        let MediaUpload {
            media,
            caption,
            data,
        } = upload;
        let length = data.len() as u64;
        let part = Part::stream_with_length(data, length);
        self.send_upload(target, &media, caption.as_ref(), part)
            .await
    }

    async fn send_media_stream(
        &self,
        target: ChatId,
        media: &MediaDescriptor,
        caption: Option<&FormattedText>,
        body: ByteStream,
    ) -> TransportResult<MessageId> {
        let body = reqwest::Body::wrap_stream(body);
        let part = match media.size {
            Some(size) => Part::stream_with_length(body, size),
            None => Part::stream(body),
        };
        self.send_upload(target, media, caption, part).await
    }

    async fn edit(
        &self,
        target: ChatId,
        message: MessageId,
        content: &EditContent,
    ) -> TransportResult<()> {
        let (method, body) = match content {
            EditContent::Text(text) => ("editMessageText", text_body(target, Some(message), text)),
            EditContent::Caption(caption) => (
                "editMessageCaption",
                caption_body(target, message, caption.as_ref()),
            ),
        };
        let _: serde_json::Value = self.call(method, &body).await?;
        Ok(())
    }

    async fn delete(&self, target: ChatId, message: MessageId) -> TransportResult<()> {
        let _: bool = self
            .call(
                "deleteMessage",
                &serde_json::json!({
                    "chat_id": target.get(),
                    "message_id": message.get(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn fetch(&self, _source: MessageRef, media: &MediaDescriptor) -> TransportResult<Bytes> {
        let response = self.download(media).await?;
        let data = response.bytes().await.map_err(api::network_error)?;
        if data.is_empty() {
            return Err(TransportError::ContentUnavailable(format!(
                "empty download for {}",
                media.file_id
            )));
        }
        tracing::debug!(
            file_id = %media.file_id,
            bytes = data.len(),
            "downloaded source media"
        );
        Ok(data)
    }

    async fn fetch_stream(
        &self,
        _source: MessageRef,
        media: &MediaDescriptor,
    ) -> TransportResult<ByteStream> {
        let response = self.download(media).await?;
        Ok(response
            .bytes_stream()
            .map_err(api::network_error)
            .boxed())
    }

    async fn content_size(
        &self,
        _source: MessageRef,
        media: &MediaDescriptor,
    ) -> TransportResult<Option<u64>> {
        Ok(self.file_path(media).await?.file_size)
    }
}
