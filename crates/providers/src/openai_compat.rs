//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI and any endpoint that speaks its wire format.
//!
//! Supports:
//! - Chat completions (non-streaming and streaming SSE)
//! - Embeddings and moderation
//! - The Files and Batches endpoints used for batch generation

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use rondo_core::error::ProviderError;
use rondo_core::message::ChatMessage;
use rondo_core::provider::*;
use serde::Deserialize;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider with a request timeout.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new(
            "openai",
            "https://api.openai.com/v1",
            api_key,
            Duration::from_secs(120),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn chat_body(request: &ProviderRequest, stream: bool) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        body
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(self.url(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(map_transport)?;
        check_status(response).await
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .get(self.url(path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(map_transport)?;
        check_status(response).await
    }
}

fn map_transport(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else {
        ProviderError::Network(e.to_string())
    }
}

/// Map non-success HTTP statuses onto typed provider errors.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status().as_u16();

    if status == 429 {
        let retry_after_secs = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        return Err(ProviderError::RateLimited { retry_after_secs });
    }

    if status == 401 || status == 403 {
        return Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }

    if !(200..300).contains(&status) {
        let error_body = response.text().await.unwrap_or_default();
        warn!(status, body = %error_body, "Provider returned error");
        if status == 404 && error_body.contains("model") {
            return Err(ProviderError::ModelNotFound(error_body));
        }
        return Err(ProviderError::ApiError {
            status_code: status,
            message: error_body,
        });
    }

    Ok(response)
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
    what: &str,
) -> Result<T, ProviderError> {
    response.json().await.map_err(|e| ProviderError::ApiError {
        status_code: 200,
        message: format!("Failed to parse {what} response: {e}"),
    })
}

#[async_trait]
impl rondo_core::Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        debug!(provider = %self.name, model = %request.model, messages = request.messages.len(), "Sending completion request");

        let response = self
            .post_json("chat/completions", &Self::chat_body(&request, false))
            .await?;
        let api_response: ApiResponse = parse_json(response, "completion").await?;
        api_response.into_provider_response()
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ProviderStream, ProviderError> {
        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(self.url("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&Self::chat_body(&request, true))
            .send()
            .await
            .map_err(map_transport)?;
        let response = check_status(response).await?;

        let body = response
            .bytes_stream()
            .map(|r| r.map(|b| b.to_vec()))
            .boxed();

        Ok(sse_chunks(body, self.name.clone()))
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        debug!(
            provider = %self.name,
            model = %request.model,
            count = request.inputs.len(),
            "Sending embedding request"
        );

        let body = serde_json::json!({
            "model": request.model,
            "input": request.inputs,
            "encoding_format": "float",
        });
        let response = self.post_json("embeddings", &body).await?;
        let mut api_resp: EmbeddingApiResponse = parse_json(response, "embedding").await?;

        // The API may return rows out of order; `index` is authoritative.
        api_resp.data.sort_by_key(|d| d.index);
        Ok(EmbeddingResponse {
            embeddings: api_resp.data.into_iter().map(|d| d.embedding).collect(),
            model: api_resp.model,
        })
    }

    async fn moderate(&self, input: &str) -> Result<ModerationVerdict, ProviderError> {
        debug!(provider = %self.name, chars = input.chars().count(), "Sending moderation request");

        let body = serde_json::json!({ "input": input });
        let response = self.post_json("moderations", &body).await?;
        let api_resp: ModerationApiResponse = parse_json(response, "moderation").await?;
        api_resp.into_verdict()
    }

    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ProviderError::BatchFile(format!("{}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch_input.jsonl".into());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/jsonl")
            .map_err(|e| ProviderError::BatchFile(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let response = self
            .client
            .post(self.url("files"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(map_transport)?;
        let response = check_status(response).await?;
        let file: FileObject = parse_json(response, "file upload").await?;

        debug!(provider = %self.name, file_id = %file.id, "Uploaded batch input file");
        Ok(file.id)
    }

    async fn create_batch(&self, request: CreateBatchRequest) -> Result<BatchJob, ProviderError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| ProviderError::BatchFile(e.to_string()))?;
        let response = self.post_json("batches", &body).await?;
        parse_json(response, "batch").await
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<BatchJob, ProviderError> {
        let response = self.get(&format!("batches/{batch_id}")).await?;
        parse_json(response, "batch").await
    }

    async fn file_content(&self, file_id: &str) -> Result<String, ProviderError> {
        let response = self.get(&format!("files/{file_id}/content")).await?;
        response
            .text()
            .await
            .map_err(|e| ProviderError::StreamInterrupted(e.to_string()))
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let response = self
            .client
            .get(self.url("models"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(map_transport)?;

        Ok(response.status().is_success())
    }
}

// --- SSE decoding ---

/// What one SSE line means for the consumer.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Chunk(StreamChunk),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseEvent {
    // Empty lines separate events; ':' lines are comments.
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    match serde_json::from_str::<StreamApiResponse>(data) {
        Ok(resp) => {
            let Some(choice) = resp.choices.into_iter().next() else {
                return SseEvent::Skip;
            };
            let content = choice.delta.content.filter(|c| !c.is_empty());
            let finish_reason = choice.finish_reason.as_deref().and_then(FinishReason::from_api);
            if content.is_none() && finish_reason.is_none() {
                SseEvent::Skip
            } else {
                SseEvent::Chunk(StreamChunk {
                    content,
                    finish_reason,
                })
            }
        }
        Err(e) => {
            trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
            SseEvent::Skip
        }
    }
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    buffer: Vec<u8>,
    pending: VecDeque<StreamChunk>,
    saw_finish: bool,
    finished: bool,
    provider: String,
}

impl SseState {
    /// Consume every complete line in the buffer.
    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            match parse_sse_line(line.trim_end_matches(['\r', '\n'])) {
                SseEvent::Chunk(chunk) => {
                    self.saw_finish |= chunk.finish_reason.is_some();
                    self.pending.push_back(chunk);
                }
                SseEvent::Done => self.finish(),
                SseEvent::Skip => {}
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if !self.saw_finish {
            self.saw_finish = true;
            self.pending.push_back(StreamChunk {
                content: None,
                finish_reason: Some(FinishReason::Stop),
            });
        }
    }
}

/// Turn an SSE byte stream into chunks. Lines are split on raw bytes so that
/// multi-byte characters spanning network reads stay intact.
fn sse_chunks(
    body: BoxStream<'static, Result<Vec<u8>, reqwest::Error>>,
    provider: String,
) -> ProviderStream {
    let state = SseState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        saw_finish: false,
        finished: false,
        provider,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    st.buffer.extend_from_slice(&bytes);
                    st.drain_lines();
                }
                Some(Err(e)) => {
                    warn!(provider = %st.provider, error = %e, "SSE stream interrupted");
                    st.finished = true;
                    return Some((Err(ProviderError::StreamInterrupted(e.to_string())), st));
                }
                None => {
                    // Flush a trailing line without newline, then close.
                    if !st.buffer.is_empty() {
                        st.buffer.push(b'\n');
                        st.drain_lines();
                    }
                    st.finish();
                }
            }
        }
    })
    .boxed()
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

impl ApiResponse {
    fn into_provider_response(self) -> Result<ProviderResponse, ProviderError> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No choices in response".into(),
            })?;

        let finish_reason = choice
            .finish_reason
            .as_deref()
            .and_then(FinishReason::from_api)
            .unwrap_or(FinishReason::Stop);

        Ok(ProviderResponse {
            message: ChatMessage::assistant(choice.message.content.unwrap_or_default()),
            finish_reason,
            usage: self.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            model: self.model,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ModerationApiResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: std::collections::BTreeMap<String, Option<bool>>,
}

impl ModerationApiResponse {
    fn into_verdict(self) -> Result<ModerationVerdict, ProviderError> {
        let result = self
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ApiError {
                status_code: 200,
                message: "No results in moderation response".into(),
            })?;

        Ok(ModerationVerdict {
            flagged: result.flagged,
            categories: result
                .categories
                .into_iter()
                .map(|(name, hit)| (name, hit.unwrap_or(false)))
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StreamApiResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}
