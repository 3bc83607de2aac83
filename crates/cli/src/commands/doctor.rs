//! `rondo doctor`: diagnose configuration and storage.

use rondo_config::AppConfig;

use crate::runtime::{CliResult, Runtime};

pub async fn run() -> CliResult<()> {
    println!("Rondo Doctor: System Diagnostics");
    println!("================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if !config_path.exists() {
        println!("  [!!] No config file: run `rondo onboard`");
        issues += 1;
    }

    let runtime = match Runtime::open().await {
        Ok(runtime) => {
            println!("  [ok] Config valid, {} store open", runtime.config.rag.backend);
            runtime
        }
        Err(e) => {
            println!("  [!!] {e}");
            println!("\n  1 blocking issue found.");
            return Ok(());
        }
    };

    if runtime.provider().is_ok() {
        println!("  [ok] API key configured (model {})", runtime.config.completion.model);
    } else {
        println!("  [!!] No API key: set RONDO_API_KEY or OPENAI_API_KEY");
        issues += 1;
    }

    match runtime.knowledge() {
        Ok(knowledge) => match knowledge.count().await {
            Ok(count) => println!("  [ok] Knowledge collection '{}': {count} document(s)", knowledge.name()),
            Err(e) => {
                println!("  [!!] Knowledge collection unreadable: {e}");
                issues += 1;
            }
        },
        Err(e) => println!("  [--] Knowledge collection unavailable: {e}"),
    }

    let engines = runtime.engines();
    let entities = runtime.store.list_entities().await?;
    if entities.is_empty() {
        println!("  [!!] No entities: run `rondo onboard` or `rondo entity add`");
        issues += 1;
    }
    for entity in &entities {
        let engine = engines.resolve(&entity.thinking_type);
        if runtime.store.get_timeline(entity.id).await?.is_none() {
            println!("  [!!] {} has no timeline: run `rondo reset`", entity.name);
            issues += 1;
        }
        if let Some(material_type) = &engine.material_type {
            if runtime.store.count_materials(material_type).await? == 0 {
                println!(
                    "  [!!] {} ({}) has no '{material_type}' material and will never speak",
                    entity.name, entity.thinking_type
                );
                issues += 1;
            }
        }
    }

    println!();
    if issues == 0 {
        println!("  All checks passed!");
    } else {
        println!("  {issues} issue(s) found. See above for details.");
    }
    Ok(())
}
