//! `rondo chat`: single-message or interactive chat.

use std::io::Write;

use futures::StreamExt;
use rondo_agent::{ChatReply, ChatSession};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::runtime::{CliResult, Runtime};

pub async fn run(user: String, message: Option<String>, stream: bool, sse: bool) -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let session = runtime.chat(&user)?;
    let stream = stream || runtime.config.completion.streaming;

    if let Some(message) = message {
        return exchange(&session, &message, stream, sse).await;
    }

    println!();
    println!("  Rondo Chat: Interactive Mode");
    println!("  Model: {}  User: {user}", runtime.config.completion.model);
    println!("  Type 'exit' or Ctrl+C to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if let Err(e) = exchange(&session, line, stream, sse).await {
            eprintln!("  [Error] {e}");
        }
        println!();
    }

    println!("\n  Goodbye!\n");
    Ok(())
}

async fn exchange(session: &ChatSession, input: &str, stream: bool, sse: bool) -> CliResult<()> {
    if stream {
        let mut chunks = session.send_stream(input).await?;
        while let Some(chunk) = chunks.next().await {
            if sse {
                print!("{}", chunk.to_sse_frame());
            } else if let Some(text) = &chunk.content {
                print!("{text}");
            }
            std::io::stdout().flush()?;
        }
        println!();
        return Ok(());
    }

    match session.send(input).await? {
        ChatReply::Answer { content, evaluation, .. } => {
            println!("{content}");
            if let Some(evaluation) = evaluation {
                match &evaluation.parsed {
                    Some(parsed) => println!("\n[evaluation] {}", serde_json::to_string_pretty(parsed)?),
                    None => println!("\n[evaluation] {}", evaluation.raw),
                }
            }
        }
        ChatReply::Blocked { message, .. } => println!("{message}"),
    }
    Ok(())
}
