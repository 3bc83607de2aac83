//! `rondo reset`, `rondo simulate`, `rondo turn` and `rondo run`.

use std::collections::HashMap;

use rondo_agent::{ScheduledTurn, TOPIC_ENTITY_ID, TurnOutcome, TurnScheduler};
use rondo_core::conversation::EntityId;

use crate::runtime::{CliResult, Runtime};

fn print_window(window: &[ScheduledTurn]) {
    if window.is_empty() {
        println!("No entity can act.");
        return;
    }
    println!("{:>5}  {:>7}  {:<24} {:>10}", "turn", "action", "entity", "clock");
    for turn in window {
        println!(
            "{:>5}  {:>7}  {:<24} {:>10.4}",
            turn.acted_at_turn, turn.action_id, turn.name, turn.next_turn
        );
    }
}

pub async fn reset() -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let scheduler = TurnScheduler::new(runtime.store.clone());
    let window = scheduler
        .reset_timeline(runtime.config.orchestrator.simulate_steps)
        .await?;
    println!("Conversation reset.\n");
    print_window(&window);
    Ok(())
}

pub async fn simulate(steps: Option<usize>) -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let steps = steps.unwrap_or(runtime.config.orchestrator.simulate_steps);
    let window = TurnScheduler::new(runtime.store.clone())
        .simulate_next_actions(steps)
        .await?;
    print_window(&window);
    Ok(())
}

pub async fn run(turns: usize, topic: Option<String>, reset: bool) -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let orchestrator = runtime.orchestrator()?;

    if reset {
        orchestrator.reset().await?;
    }
    if let Some(topic) = topic {
        orchestrator.post_topic(&topic).await?;
        println!("[topic] {topic}\n");
    }

    let names: HashMap<EntityId, String> = runtime
        .store
        .list_entities()
        .await?
        .into_iter()
        .map(|e| (e.id, e.name))
        .chain(std::iter::once((TOPIC_ENTITY_ID, "topic".to_string())))
        .collect();
    let name_of = |id: &EntityId| names.get(id).cloned().unwrap_or_else(|| format!("#{id}"));

    for _ in 0..turns {
        let Some(outcome) = orchestrator.run_next_turn().await? else {
            println!("No entity can act.");
            break;
        };
        match &outcome {
            TurnOutcome::Spoke {
                entity_id,
                content,
                from_material,
                evaluation,
                ..
            } => {
                let marker = if *from_material { " (from material)" } else { "" };
                println!("[{}]{marker} {content}\n", name_of(entity_id));
                if let Some(evaluation) = evaluation {
                    match &evaluation.parsed {
                        Some(parsed) => println!("[evaluation] {}\n", serde_json::to_string_pretty(parsed)?),
                        None => println!("[evaluation] {}\n", evaluation.raw),
                    }
                }
            }
            TurnOutcome::Blocked {
                entity_id, category, message, ..
            } => println!("[{}] blocked ({category}): {message}\n", name_of(entity_id)),
            TurnOutcome::Skipped { message, .. } => println!("{message}\n"),
            TurnOutcome::Inconsistent { message, .. } => {
                eprintln!("{message}");
                return Err(message.clone().into());
            }
        }
    }
    Ok(())
}
