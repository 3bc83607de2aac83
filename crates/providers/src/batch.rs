//! Asynchronous batch generation over the Files and Batches endpoints.
//!
//! A batch is submitted as a JSONL file with one chat request per line. The
//! local file is created under a unique name and removed again on every exit
//! path by [`ScopedFile`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use rondo_config::BatchSettings;
use rondo_core::error::{Error, ProviderError, Result};
use rondo_core::message::ChatMessage;
use rondo_core::provider::{BatchJob, BatchStatus, CreateBatchRequest, Provider};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const BATCH_ENDPOINT: &str = "/v1/chat/completions";
pub const COMPLETION_WINDOW: &str = "24h";

/// One request in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    pub custom_id: String,
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
}

impl MessageChunk {
    /// A chunk with a fresh uuid `custom_id`.
    pub fn new(messages: Vec<ChatMessage>, model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            custom_id: uuid::Uuid::new_v4().to_string(),
            messages,
            model: model.into(),
            max_tokens,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchLine {
    custom_id: String,
    method: String,
    url: String,
    body: BatchBody,
}

#[derive(Debug, Serialize, Deserialize)]
struct BatchBody {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

/// Render chunks as batch input JSONL (one request per line).
pub fn to_jsonl(chunks: &[MessageChunk]) -> Result<String> {
    let mut out = String::new();
    for chunk in chunks {
        let line = BatchLine {
            custom_id: chunk.custom_id.clone(),
            method: "POST".into(),
            url: BATCH_ENDPOINT.into(),
            body: BatchBody {
                model: chunk.model.clone(),
                messages: chunk.messages.clone(),
                max_tokens: chunk.max_tokens,
            },
        };
        out.push_str(&serde_json::to_string(&line)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse batch input JSONL back into chunks. Blank lines are ignored.
pub fn parse_batch_input(jsonl: &str) -> Result<Vec<MessageChunk>> {
    jsonl
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| -> Result<MessageChunk> {
            let line: BatchLine = serde_json::from_str(l)?;
            Ok(MessageChunk {
                custom_id: line.custom_id,
                messages: line.body.messages,
                model: line.body.model,
                max_tokens: line.body.max_tokens,
            })
        })
        .collect()
}

/// One reply from a finished batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput {
    pub custom_id: String,
    pub message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OutputLine {
    custom_id: String,
    #[serde(default)]
    response: Option<OutputResponse>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OutputResponse {
    status_code: u16,
    body: OutputBody,
}

#[derive(Debug, Deserialize)]
struct OutputBody {
    #[serde(default)]
    choices: Vec<OutputChoice>,
}

#[derive(Debug, Deserialize)]
struct OutputChoice {
    message: ChatMessage,
}

/// Parse the output file of a completed batch, one message per line.
pub fn parse_batch_output(text: &str) -> Result<Vec<BatchOutput>> {
    let mut outputs = Vec::new();
    for raw in text.lines().filter(|l| !l.trim().is_empty()) {
        let line: OutputLine = serde_json::from_str(raw)?;
        if let Some(error) = line.error.filter(|e| !e.is_null()) {
            warn!(custom_id = %line.custom_id, %error, "Batch request failed");
            continue;
        }
        let Some(response) = line.response else {
            continue;
        };
        if response.status_code != 200 {
            warn!(custom_id = %line.custom_id, status = response.status_code, "Batch request returned non-200");
            continue;
        }
        if let Some(choice) = response.body.choices.into_iter().next() {
            outputs.push(BatchOutput {
                custom_id: line.custom_id,
                message: choice.message,
            });
        }
    }
    Ok(outputs)
}

/// A file that is removed when dropped.
#[derive(Debug)]
pub struct ScopedFile {
    path: PathBuf,
}

impl ScopedFile {
    /// Create `batch_input_<10 hex>.jsonl` under `dir` with `contents`.
    pub fn create_in(dir: &Path, contents: &str) -> Result<Self> {
        let suffix: u64 = rand::rng().random::<u64>() & 0xff_ffff_ffff;
        let path = dir.join(format!("batch_input_{suffix:010x}.jsonl"));
        std::fs::write(&path, contents).map_err(|e| {
            Error::BudgetExceeded(format!("cannot create batch file {}: {e}", path.display()))
        })?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove batch file");
            }
        }
    }
}

/// Identifies a submitted batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub batch_id: String,
    pub input_file_id: String,
}

/// Submits and polls batches on a provider.
pub struct BatchRunner {
    provider: Arc<dyn Provider>,
    work_dir: PathBuf,
    poll_interval: Duration,
    max_wait: Duration,
}

impl BatchRunner {
    pub fn new(provider: Arc<dyn Provider>, settings: &BatchSettings) -> Self {
        Self {
            provider,
            work_dir: std::env::temp_dir(),
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            max_wait: Duration::from_secs(settings.max_wait_secs),
        }
    }

    /// Directory for the temporary JSONL input.
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Write, upload, and create the batch.
    pub async fn submit(&self, chunks: &[MessageChunk]) -> Result<BatchHandle> {
        if chunks.is_empty() {
            return Err(Error::invalid_config("a batch needs at least one request"));
        }

        let file = ScopedFile::create_in(&self.work_dir, &to_jsonl(chunks)?)?;
        debug!(path = %file.path().display(), requests = chunks.len(), "Wrote batch input");

        let input_file_id = self.provider.upload_batch_file(file.path()).await?;
        let job = self
            .provider
            .create_batch(CreateBatchRequest {
                input_file_id: input_file_id.clone(),
                endpoint: BATCH_ENDPOINT.into(),
                completion_window: COMPLETION_WINDOW.into(),
            })
            .await?;

        info!(batch_id = %job.id, status = job.status.as_str(), "Batch submitted");
        Ok(BatchHandle {
            batch_id: job.id,
            input_file_id,
        })
    }

    pub async fn status(&self, handle: &BatchHandle) -> Result<BatchJob> {
        Ok(self.provider.retrieve_batch(&handle.batch_id).await?)
    }

    /// Poll until the batch is terminal, then download and parse the output.
    pub async fn wait(&self, handle: &BatchHandle) -> Result<Vec<BatchOutput>> {
        let started = Instant::now();
        loop {
            let job = self.status(handle).await?;
            debug!(batch_id = %job.id, status = job.status.as_str(), "Polled batch");

            match job.status {
                BatchStatus::Completed => {
                    let output_id = job.output_file_id.ok_or_else(|| {
                        ProviderError::BatchFile(format!("batch {} has no output file", job.id))
                    })?;
                    let text = self.provider.file_content(&output_id).await?;
                    return parse_batch_output(&text);
                }
                status if status.is_terminal() => {
                    return Err(ProviderError::BatchFailed {
                        batch_id: job.id,
                        status: status.as_str().into(),
                    }
                    .into());
                }
                _ => {}
            }

            if started.elapsed() >= self.max_wait {
                return Err(ProviderError::Timeout(format!(
                    "batch {} still {} after {:?}",
                    handle.batch_id,
                    job.status.as_str(),
                    self.max_wait
                ))
                .into());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submit and wait in one call.
    pub async fn run(&self, chunks: &[MessageChunk]) -> Result<Vec<BatchOutput>> {
        let handle = self.submit(chunks).await?;
        self.wait(&handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rondo_core::provider::{ProviderRequest, ProviderResponse};
    use std::sync::Mutex;

    /// Fake Files/Batches backend: records the uploaded file, walks through a
    /// fixed status sequence.
    struct FakeBatches {
        uploaded: Mutex<Option<(PathBuf, String)>>,
        created: Mutex<Option<CreateBatchRequest>>,
        statuses: Mutex<Vec<BatchStatus>>,
        output: String,
        fail_upload: bool,
    }

    impl FakeBatches {
        fn new(statuses: Vec<BatchStatus>, output: &str) -> Self {
            Self {
                uploaded: Mutex::new(None),
                created: Mutex::new(None),
                statuses: Mutex::new(statuses),
                output: output.into(),
                fail_upload: false,
            }
        }
    }

    #[async_trait]
    impl Provider for FakeBatches {
        fn name(&self) -> &str {
            "fake"
        }

        async fn complete(
            &self,
            _request: ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Err(ProviderError::NotConfigured("batch only".into()))
        }

        async fn upload_batch_file(&self, path: &Path) -> std::result::Result<String, ProviderError> {
            if self.fail_upload {
                return Err(ProviderError::Network("upload failed".into()));
            }
            let contents = std::fs::read_to_string(path).unwrap();
            *self.uploaded.lock().unwrap() = Some((path.to_path_buf(), contents));
            Ok("file-in".into())
        }

        async fn create_batch(
            &self,
            request: CreateBatchRequest,
        ) -> std::result::Result<BatchJob, ProviderError> {
            *self.created.lock().unwrap() = Some(request.clone());
            Ok(BatchJob {
                id: "batch_1".into(),
                status: BatchStatus::Validating,
                input_file_id: request.input_file_id,
                output_file_id: None,
                error_file_id: None,
            })
        }

        async fn retrieve_batch(&self, batch_id: &str) -> std::result::Result<BatchJob, ProviderError> {
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.remove(0)
            } else {
                statuses[0]
            };
            Ok(BatchJob {
                id: batch_id.into(),
                status,
                input_file_id: "file-in".into(),
                output_file_id: (status == BatchStatus::Completed).then(|| "file-out".into()),
                error_file_id: None,
            })
        }

        async fn file_content(&self, file_id: &str) -> std::result::Result<String, ProviderError> {
            assert_eq!(file_id, "file-out");
            Ok(self.output.clone())
        }
    }

    const OUTPUT: &str = r#"{"id":"r1","custom_id":"c-1","response":{"status_code":200,"body":{"choices":[{"message":{"role":"assistant","content":"答え1"}}]}},"error":null}
{"id":"r2","custom_id":"c-2","response":null,"error":{"code":"server_error"}}
"#;

    fn chunks() -> Vec<MessageChunk> {
        vec![
            MessageChunk::new(vec![ChatMessage::user("質問1")], "gpt-4o-mini", 100),
            MessageChunk::new(
                vec![ChatMessage::system("be brief"), ChatMessage::user("質問2")],
                "gpt-4o-mini",
                50,
            ),
        ]
    }

    #[test]
    fn jsonl_lines_follow_batch_format() {
        let chunks = chunks();
        let jsonl = to_jsonl(&chunks).unwrap();
        let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["method"], "POST");
        assert_eq!(first["url"], "/v1/chat/completions");
        assert_eq!(first["custom_id"], chunks[0].custom_id.as_str());
        assert_eq!(first["body"]["max_tokens"], 100);
        assert_eq!(first["body"]["messages"][0]["role"], "user");

        assert_eq!(parse_batch_input(&jsonl).unwrap(), chunks);
    }

    #[test]
    fn custom_ids_are_unique() {
        let chunks = chunks();
        assert_ne!(chunks[0].custom_id, chunks[1].custom_id);
    }

    #[test]
    fn output_parsing_skips_failed_lines() {
        let outputs = parse_batch_output(OUTPUT).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].custom_id, "c-1");
        assert_eq!(outputs[0].message.content, "答え1");
    }

    #[test]
    fn scoped_file_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let file = ScopedFile::create_in(dir.path(), "{}\n").unwrap();
            let name = file.path().file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("batch_input_"));
            assert_eq!(name.len(), "batch_input_".len() + 10 + ".jsonl".len());
            assert!(file.path().exists());
            file.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn scoped_file_creation_failure_is_budget_error() {
        let err = ScopedFile::create_in(Path::new("/nonexistent/dir"), "x").unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded(_)));
    }

    #[tokio::test]
    async fn run_polls_until_completed() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBatches::new(
            vec![BatchStatus::InProgress, BatchStatus::Finalizing, BatchStatus::Completed],
            OUTPUT,
        ));
        let runner = BatchRunner::new(provider.clone(), &BatchSettings::default())
            .with_work_dir(dir.path())
            .with_poll_interval(Duration::from_millis(1));

        let outputs = runner.run(&chunks()).await.unwrap();
        assert_eq!(outputs.len(), 1);

        let created = provider.created.lock().unwrap().clone().unwrap();
        assert_eq!(created.endpoint, "/v1/chat/completions");
        assert_eq!(created.completion_window, "24h");
        assert_eq!(created.input_file_id, "file-in");

        let (path, contents) = provider.uploaded.lock().unwrap().clone().unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(!path.exists(), "temp file must be deleted after submit");
    }

    #[tokio::test]
    async fn terminal_failure_status_errors() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FakeBatches::new(vec![BatchStatus::Expired], ""));
        let runner = BatchRunner::new(provider, &BatchSettings::default())
            .with_work_dir(dir.path())
            .with_poll_interval(Duration::from_millis(1));

        let err = runner.run(&chunks()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(ProviderError::BatchFailed { ref status, .. }) if status == "expired"
        ));
    }

    #[tokio::test]
    async fn temp_file_removed_when_upload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeBatches::new(vec![BatchStatus::Completed], "");
        fake.fail_upload = true;
        let runner = BatchRunner::new(Arc::new(fake), &BatchSettings::default()).with_work_dir(dir.path());

        assert!(runner.submit(&chunks()).await.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
