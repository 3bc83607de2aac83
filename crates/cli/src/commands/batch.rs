//! `rondo batch`: run a JSONL file of chat requests through the Batches API.

use std::io::Write;
use std::path::PathBuf;

use rondo_providers::BatchRunner;
use rondo_providers::batch::parse_batch_input;
use tracing::info;

use crate::runtime::{CliResult, Runtime};

pub async fn run(input: PathBuf, output: Option<PathBuf>) -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let jsonl = std::fs::read_to_string(&input)?;
    let chunks = parse_batch_input(&jsonl)?;
    if chunks.is_empty() {
        return Err(format!("{} holds no requests", input.display()).into());
    }
    info!(requests = chunks.len(), "Submitting batch");

    let runner = BatchRunner::new(runtime.provider()?, &runtime.config.batch);
    let outputs = runner.run(&chunks).await?;

    let mut out: Box<dyn Write> = match &output {
        Some(path) => Box::new(std::fs::File::create(path)?),
        None => Box::new(std::io::stdout()),
    };
    for reply in &outputs {
        let line = serde_json::json!({
            "custom_id": reply.custom_id,
            "role": reply.message.role,
            "content": reply.message.content,
        });
        writeln!(out, "{line}")?;
    }
    if let Some(path) = output {
        println!("Wrote {} repl(ies) to {}", outputs.len(), path.display());
    }
    Ok(())
}
