//! `rondo material`, `rondo knowledge` and `rondo forbid`.

use std::path::{Path, PathBuf};

use rondo_core::conversation::RagMaterial;
use rondo_core::rag::Document;
use tracing::warn;

use crate::runtime::{CliResult, Runtime};

/// Split text into paragraphs on blank lines.
pub fn paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_text(file: Option<&Path>, text: Option<String>) -> CliResult<String> {
    let text = match (file, text) {
        (Some(path), _) => std::fs::read_to_string(path)?,
        (None, Some(text)) => text,
        (None, None) => return Err("Give the material as text or with --file".into()),
    };
    if text.trim().is_empty() {
        return Err("Material is empty".into());
    }
    Ok(text)
}

pub async fn add(material_type: String, file: Option<PathBuf>, text: Option<String>, id: Option<String>) -> CliResult<()> {
    let text = read_text(file.as_deref(), text)?;
    let runtime = Runtime::open().await?;

    let id = match id {
        Some(id) => id,
        None => format!(
            "{material_type}_{}",
            runtime.store.count_materials(&material_type).await? + 1
        ),
    };
    runtime
        .store
        .upsert_material(&RagMaterial::new(id.as_str(), material_type.as_str(), text.as_str()))
        .await?;
    println!("Stored material '{id}' ({material_type}, {} chars)", text.chars().count());

    // Keep the knowledge collection in step so reframing can search it.
    let knowledge = match runtime.knowledge() {
        Ok(knowledge) => knowledge,
        Err(e) => {
            warn!(error = %e, "Material not indexed in the knowledge collection");
            return Ok(());
        }
    };
    let documents: Vec<Document> = paragraphs(&text)
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            Document::new(format!("{id}#{i}"), p)
                .with_metadata("material_type", material_type.as_str())
                .with_metadata("material_id", id.as_str())
        })
        .collect();
    let count = documents.len();
    runtime.retry().run("knowledge upsert", || knowledge.upsert(documents.clone())).await?;
    println!("Indexed {count} paragraph(s) in '{}'", knowledge.name());
    Ok(())
}

pub async fn ingest(file: PathBuf, material_type: Option<String>) -> CliResult<()> {
    let text = std::fs::read_to_string(&file)?;
    let runtime = Runtime::open().await?;
    let knowledge = runtime.knowledge()?;

    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".into());
    let documents: Vec<Document> = paragraphs(&text)
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let doc = Document::new(format!("{stem}#{i}"), p).with_metadata("source", file.to_string_lossy().into_owned());
            match &material_type {
                Some(t) => doc.with_metadata("material_type", t.as_str()),
                None => doc,
            }
        })
        .collect();
    if documents.is_empty() {
        return Err(format!("{} has no text", file.display()).into());
    }

    let count = documents.len();
    runtime.retry().run("knowledge upsert", || knowledge.upsert(documents.clone())).await?;
    println!(
        "Ingested {count} paragraph(s) from {} into '{}' ({} total)",
        file.display(),
        knowledge.name(),
        knowledge.count().await?
    );
    Ok(())
}

pub async fn forbid(words: Vec<String>) -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let words = if words.is_empty() {
        runtime.config.guardrail.forbidden_words.clone()
    } else {
        words
    };
    let semantic = runtime.semantic()?;
    let count = semantic.setup_forbidden_words(&words).await?;
    println!("Forbidden-word collection now holds {count} word(s)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let text = "一段落目\n続き\n\n\n二段落目\n\n   \n";
        assert_eq!(paragraphs(text), vec!["一段落目\n続き", "二段落目"]);
    }

    #[test]
    fn material_needs_text() {
        assert!(read_text(None, None).is_err());
        assert!(read_text(None, Some("  ".into())).is_err());
        assert_eq!(read_text(None, Some("本文".into())).unwrap(), "本文");
    }
}
