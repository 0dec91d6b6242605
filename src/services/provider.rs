//! Provider adapter: streaming chat invocation against the external model
//! gateway. The worker only consumes this interface; the wire protocol
//! behind it is the provider's concern.

use std::future::Future;
use std::pin::Pin;

use futures::stream::{Stream, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// One message in a chat exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".to_string(), content: content.into() }
    }
}

/// Invocation options for one streamed chat call.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model_id: String,
    pub region: String,
    pub max_tokens: u32,
}

/// One element of a provider response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatChunk {
    Chunk { content: String },
    Error { error: String },
    Debug { log: String },
}

/// A lazy, finite, non-restartable response stream. Dropping it disposes
/// the underlying connection, which is how a timed-out call is abandoned.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatChunk, ProviderError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed provider chunk: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Anything that can run a streamed chat call. The worker is generic over
/// this so tests can substitute a scripted provider.
pub trait ProviderAdapter: Send + Sync {
    fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> impl Future<Output = Result<ChatStream, ProviderError>> + Send;
}

/// HTTP implementation speaking the gateway's `data: `-framed chunk stream.
pub struct HttpProviderAdapter {
    http: Client,
    base_url: String,
    api_token: String,
}

#[derive(Serialize)]
struct StreamChatRequest<'a> {
    model: &'a str,
    region: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    stream: bool,
}

impl HttpProviderAdapter {
    pub fn new(base_url: &str, api_token: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: api_token.to_string(),
        }
    }
}

impl ProviderAdapter for HttpProviderAdapter {
    fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
    ) -> impl Future<Output = Result<ChatStream, ProviderError>> + Send {
        let url = format!("{}/v1/chat/stream", self.base_url);
        let http = self.http.clone();
        let token = self.api_token.clone();
        let options = options.clone();

        async move {
            let body = StreamChatRequest {
                model: &options.model_id,
                region: &options.region,
                messages: &messages,
                max_tokens: options.max_tokens,
                stream: true,
            };

            let response = http
                .post(&url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ProviderError::Api { status: status.as_u16(), message });
            }

            Ok(chunk_stream(response.bytes_stream()))
        }
    }
}

/// Turn a raw byte stream into framed `ChatChunk`s. Lines are `data: `
/// prefixed JSON, events separated by blank lines; `[DONE]` ends the
/// stream. Partial lines are buffered across network reads.
fn chunk_stream<S>(bytes: S) -> ChatStream
where
    S: Stream<Item = reqwest::Result<bytes::Bytes>> + Send + 'static,
{
    let stream = futures::stream::try_unfold(
        (Box::pin(bytes), String::new(), false),
        |(mut inner, mut buf, mut done)| async move {
            loop {
                if done {
                    return Ok(None);
                }

                if let Some(pos) = buf.find('\n') {
                    let line: String = buf.drain(..=pos).collect();
                    match parse_line(line.trim()) {
                        LineOutcome::Chunk(chunk) => {
                            return Ok(Some((chunk?, (inner, buf, done))));
                        }
                        LineOutcome::Done => return Ok(None),
                        LineOutcome::Skip => continue,
                    }
                }

                match inner.next().await {
                    Some(Ok(bytes)) => buf.push_str(&String::from_utf8_lossy(&bytes)),
                    Some(Err(e)) => return Err(ProviderError::Http(e)),
                    None => {
                        done = true;
                        // Flush a trailing line that lacked its newline.
                        let line = std::mem::take(&mut buf);
                        match parse_line(line.trim()) {
                            LineOutcome::Chunk(chunk) => {
                                return Ok(Some((chunk?, (inner, buf, done))));
                            }
                            LineOutcome::Done | LineOutcome::Skip => return Ok(None),
                        }
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

enum LineOutcome {
    Chunk(Result<ChatChunk, ProviderError>),
    Done,
    Skip,
}

fn parse_line(line: &str) -> LineOutcome {
    let Some(data) = line.strip_prefix("data: ") else {
        return LineOutcome::Skip;
    };
    if data == "[DONE]" {
        return LineOutcome::Done;
    }
    LineOutcome::Chunk(serde_json::from_str(data).map_err(ProviderError::from))
}

/// Drain a stream into its concatenated content, stopping at the first
/// error chunk. Returns (content, chunk_count, first_error).
pub async fn collect_stream(
    mut stream: ChatStream,
) -> (String, u32, Option<String>) {
    let mut content = String::new();
    let mut chunks = 0u32;

    while let Some(item) = stream.try_next().await.transpose() {
        match item {
            Ok(ChatChunk::Chunk { content: c }) => {
                content.push_str(&c);
                chunks += 1;
            }
            Ok(ChatChunk::Error { error }) => return (content, chunks, Some(error)),
            Ok(ChatChunk::Debug { log }) => {
                tracing::debug!(log = %log, "provider debug chunk");
            }
            Err(e) => return (content, chunks, Some(e.to_string())),
        }
    }
    (content, chunks, None)
}
