//! `rondo onboard`: first-time setup.

use rondo_agent::TurnScheduler;
use rondo_config::AppConfig;
use rondo_core::store::NewEntity;

use crate::runtime::{CliResult, Runtime};

pub async fn run() -> CliResult<()> {
    let config_dir = AppConfig::config_dir();
    let config_path = config_dir.join("config.toml");

    println!("Rondo: First-Time Setup");
    println!("=======================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("  Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("  Config already exists at: {}", config_path.display());
        println!("  Edit it manually or delete it and re-run onboard.");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("  Created config.toml at: {}", config_path.display());
    }

    let runtime = Runtime::open().await?;
    println!("  Data directory: {}", runtime.config.rag.persist_directory.display());

    // Seed the cast only into an empty conversation.
    if runtime.store.list_entities().await?.is_empty() {
        for seed in &runtime.config.entities {
            let entity = runtime
                .store
                .create_entity(NewEntity {
                    name: seed.name.clone(),
                    speed: seed.speed,
                    thinking_type: seed.thinking_type.clone(),
                    forbidden_keywords: seed.forbidden_keywords.clone(),
                })
                .await?;
            println!("  Created entity #{} {} ({})", entity.id, entity.name, entity.thinking_type);
        }
        let count = TurnScheduler::new(runtime.store.clone()).initialize_timeline().await?;
        println!("  Initialized {count} timeline(s)");
    } else {
        println!("  Entities already exist; leaving them alone");
    }

    println!("\nNext steps:");
    println!("  1. Set RONDO_API_KEY (or OPENAI_API_KEY)");
    println!("  2. rondo material add cloud_act --file cloud_act.txt");
    println!("  3. rondo run --reset --topic \"クラウド法案について\"\n");
    Ok(())
}
