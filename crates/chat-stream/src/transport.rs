use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{StreamExt as _, TryStreamExt as _};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::conversation::{AttachmentRef, WireMessage};
use crate::errors::{ChatError, TransportError, transport_error_from_reqwest};

/// Body of a confirmed 2xx `text/event-stream` response.
pub type EventStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Largest attachment the backend accepts.
pub const MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;

/// Payload posted to the chat endpoint.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ChatRequest {
    pub messages: Vec<WireMessage>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// A local file waiting to be uploaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl Attachment {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// Rejects files the backend would refuse, before any request is made.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.bytes.is_empty() {
            return Err(TransportError::validation(format!(
                "attachment {} is empty",
                self.file_name
            )));
        }
        if self.bytes.len() > MAX_ATTACHMENT_BYTES {
            return Err(TransportError::validation(format!(
                "attachment {} is {} bytes, the limit is {MAX_ATTACHMENT_BYTES}",
                self.file_name,
                self.bytes.len()
            )));
        }
        Ok(())
    }
}

/// Sends chat requests and uploads to the backend.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Posts the request and returns the event-stream body once the backend
    /// answered with a 2xx `text/event-stream` response.
    ///
    /// Dropping the returned stream aborts the request.
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, TransportError>;

    /// Uploads one attachment and returns its backend reference.
    async fn upload(&self, attachment: &Attachment) -> Result<AttachmentRef, TransportError>;
}

/// Uploads `attachments` with at most `concurrency` requests in flight.
///
/// Results keep input order. Every attachment is validated before the first
/// request; the first failure aborts the uploads still in flight.
pub async fn upload_all<T>(
    transport: &T,
    attachments: &[Attachment],
    concurrency: usize,
) -> Result<Vec<AttachmentRef>, TransportError>
where
    T: ChatTransport + ?Sized,
{
    for attachment in attachments {
        attachment.validate()?;
    }
    stream::iter(attachments.iter().map(|a| transport.upload(a)))
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}

/// `ChatTransport` over HTTP.
pub struct HttpChatTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl HttpChatTransport {
    pub fn new(config: TransportConfig) -> Result<Self, ChatError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ChatError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport from [`TransportConfig::from_env`].
    pub fn from_env() -> Result<Self, ChatError> {
        Self::new(TransportConfig::from_env()?)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.bearer_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait::async_trait]
impl ChatTransport for HttpChatTransport {
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, TransportError> {
        let timeout_ms = self.config.timeout_ms();
        debug!(
            messages = request.messages.len(),
            session_id = ?request.session_id,
            "opening chat stream"
        );
        let http_req = self
            .client
            .post(self.config.chat_url())
            .header(ACCEPT, "text/event-stream")
            .timeout(self.config.timeout)
            .json(request);
        let response = self
            .authorize(http_req)
            .send()
            .await
            .map_err(|e| transport_error_from_reqwest(&e, timeout_ms))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::status(
                status.as_u16(),
                error_detail(&body),
            ));
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !content_type.starts_with("text/event-stream") {
            return Err(TransportError::protocol(format!(
                "expected text/event-stream response, got {content_type:?}"
            )));
        }

        let body = response
            .bytes_stream()
            .map(move |item| item.map_err(|e| transport_error_from_reqwest(&e, timeout_ms)));
        Ok(body.boxed())
    }

    async fn upload(&self, attachment: &Attachment) -> Result<AttachmentRef, TransportError> {
        attachment.validate()?;
        let timeout_ms = self.config.timeout_ms();
        let part = reqwest::multipart::Part::bytes(attachment.bytes.to_vec())
            .file_name(attachment.file_name.clone())
            .mime_str(&attachment.mime_type)
            .map_err(|e| {
                TransportError::validation(format!(
                    "invalid mime type {:?}: {e}",
                    attachment.mime_type
                ))
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);
        let http_req = self
            .client
            .post(self.config.upload_url())
            .timeout(self.config.timeout)
            .multipart(form);
        let response = self
            .authorize(http_req)
            .send()
            .await
            .map_err(|e| transport_error_from_reqwest(&e, timeout_ms))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| transport_error_from_reqwest(&e, timeout_ms))?;
        if !status.is_success() {
            return Err(TransportError::status(status.as_u16(), error_detail(&body)));
        }
        let uploaded = parse_upload_response(&body, &attachment.file_name)?;
        info!(
            file_name = %uploaded.file_name,
            bytes = attachment.bytes.len(),
            "attachment uploaded"
        );
        Ok(uploaded)
    }
}

#[derive(serde::Deserialize)]
struct UploadResponse {
    #[serde(default)]
    success: bool,
    data: Option<UploadData>,
    error: Option<String>,
}

#[derive(serde::Deserialize)]
struct UploadData {
    id: Option<String>,
    file_id: Option<String>,
    file_name: Option<String>,
}

fn parse_upload_response(body: &str, fallback_name: &str) -> Result<AttachmentRef, TransportError> {
    let parsed: UploadResponse = serde_json::from_str(body)
        .map_err(|e| TransportError::protocol(format!("invalid upload response: {e}")))?;
    if !parsed.success {
        return Err(TransportError::protocol(
            parsed.error.unwrap_or_else(|| "upload rejected".to_string()),
        ));
    }
    let data = parsed
        .data
        .ok_or_else(|| TransportError::protocol("upload response has no data"))?;
    let file_id = data
        .file_id
        .or(data.id)
        .ok_or_else(|| TransportError::protocol("upload response has no file id"))?;
    Ok(AttachmentRef {
        file_id,
        file_name: data.file_name.unwrap_or_else(|| fallback_name.to_string()),
    })
}

/// Pulls a human-readable message out of an error body: the JSON `detail` or
/// `error` string when present, else the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["detail", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(ToOwned::to_owned))
        })
        .unwrap_or_else(|| body.trim().to_string())
}
