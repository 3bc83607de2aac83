//! Rondo CLI: the main entry point.
//!
//! Commands:
//! - `onboard`   Initialize config, data directory, and the seed cast
//! - `doctor`    Diagnose configuration and storage
//! - `entity`    Add or list conversation entities
//! - `material`  Store RAG material for a thinking engine
//! - `knowledge` Ingest documents into the knowledge collection
//! - `forbid`    Replace the semantic forbidden-word list
//! - `reset`     Start the conversation over
//! - `simulate`  Materialize the next window of turns
//! - `turn`      Take one turn
//! - `run`       Take several turns
//! - `chat`      One-to-one chat over a user's chat log
//! - `batch`     Run a JSONL file of chat requests through the Batches API

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod runtime;

#[derive(Parser)]
#[command(
    name = "rondo",
    about = "Rondo: a multi-agent conversation turn engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize configuration and seed entities
    Onboard,

    /// Diagnose configuration and storage
    Doctor,

    /// Manage entities
    Entity {
        #[command(subcommand)]
        action: EntityAction,
    },

    /// Manage RAG material
    Material {
        #[command(subcommand)]
        action: MaterialAction,
    },

    /// Manage the knowledge collection
    Knowledge {
        #[command(subcommand)]
        action: KnowledgeAction,
    },

    /// Replace the semantic forbidden-word list
    Forbid {
        /// Words to forbid; defaults to the configured guardrail list
        words: Vec<String>,
    },

    /// Clear the conversation and reset every clock
    Reset,

    /// Materialize the next window of turns and print it
    Simulate {
        #[arg(short, long)]
        steps: Option<usize>,
    },

    /// Take one turn
    Turn {
        /// Post a topic before the turn
        #[arg(short, long)]
        topic: Option<String>,
    },

    /// Take several turns
    Run {
        #[arg(short = 'n', long, default_value_t = 10)]
        turns: usize,

        /// Post a topic before the first turn
        #[arg(short, long)]
        topic: Option<String>,

        /// Reset the conversation first
        #[arg(long)]
        reset: bool,
    },

    /// Chat one to one
    Chat {
        /// Chat log owner
        #[arg(short, long, default_value = "cli")]
        user: String,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Stream the reply
        #[arg(long)]
        stream: bool,

        /// Print streamed chunks as Server-Sent-Events frames
        #[arg(long, requires = "stream")]
        sse: bool,
    },

    /// Run a JSONL file of chat requests through the Batches API
    Batch {
        input: PathBuf,

        /// Write replies here as JSON lines instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum EntityAction {
    /// Create an entity
    Add {
        name: String,

        /// Turns per unit of virtual time
        #[arg(short, long)]
        speed: f64,

        /// Thinking engine tag; append `_strict` for strict guardrails
        #[arg(short, long)]
        thinking_type: String,

        /// Extra forbidden keywords for this entity
        #[arg(long = "forbid")]
        forbidden: Vec<String>,
    },

    /// List entities with their clocks
    List,
}

#[derive(Subcommand)]
enum MaterialAction {
    /// Store material text for a material type
    Add {
        material_type: String,

        /// Read the text from this file
        #[arg(short, long, conflicts_with = "text")]
        file: Option<PathBuf>,

        text: Option<String>,

        /// Material id (generated when absent)
        #[arg(long)]
        id: Option<String>,
    },
}

#[derive(Subcommand)]
enum KnowledgeAction {
    /// Split a text file into paragraphs and upsert them
    Ingest {
        file: PathBuf,

        /// Tag the documents with a material type
        #[arg(short, long)]
        material_type: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Onboard => commands::onboard::run().await?,
        Commands::Doctor => commands::doctor::run().await?,
        Commands::Entity { action } => match action {
            EntityAction::Add {
                name,
                speed,
                thinking_type,
                forbidden,
            } => commands::entity::add(name, speed, thinking_type, forbidden).await?,
            EntityAction::List => commands::entity::list().await?,
        },
        Commands::Material { action } => match action {
            MaterialAction::Add {
                material_type,
                file,
                text,
                id,
            } => commands::material::add(material_type, file, text, id).await?,
        },
        Commands::Knowledge { action } => match action {
            KnowledgeAction::Ingest { file, material_type } => {
                commands::material::ingest(file, material_type).await?
            }
        },
        Commands::Forbid { words } => commands::material::forbid(words).await?,
        Commands::Reset => commands::turn::reset().await?,
        Commands::Simulate { steps } => commands::turn::simulate(steps).await?,
        Commands::Turn { topic } => commands::turn::run(1, topic, false).await?,
        Commands::Run { turns, topic, reset } => commands::turn::run(turns, topic, reset).await?,
        Commands::Chat {
            user,
            message,
            stream,
            sse,
        } => commands::chat::run(user, message, stream, sse).await?,
        Commands::Batch { input, output } => commands::batch::run(input, output).await?,
    }

    Ok(())
}
