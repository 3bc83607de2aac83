//! `rondo entity`: add and list entities.

use rondo_agent::calculate_next_turn_increment;
use rondo_core::conversation::ActionTimeline;
use rondo_core::store::NewEntity;

use crate::runtime::{CliResult, Runtime};

pub async fn add(name: String, speed: f64, thinking_type: String, forbidden: Vec<String>) -> CliResult<()> {
    let increment = calculate_next_turn_increment(speed)?;
    let runtime = Runtime::open().await?;

    let entity = runtime
        .store
        .create_entity(NewEntity {
            name,
            speed,
            thinking_type,
            forbidden_keywords: forbidden,
        })
        .await?;
    // Join at the current front of the conversation rather than at time zero.
    let front = runtime
        .store
        .list_timelines()
        .await?
        .iter()
        .map(|t| t.next_turn)
        .fold(0.0_f64, f64::max);
    let next_turn = if front > 0.0 { front + increment } else { increment };
    runtime
        .store
        .save_timeline(&ActionTimeline {
            entity_id: entity.id,
            next_turn,
            can_act: true,
        })
        .await?;

    let display = runtime.engines().display_name(&entity.thinking_type);
    println!(
        "Created entity #{} {} (speed {}, {} / {display})",
        entity.id, entity.name, entity.speed, entity.thinking_type
    );
    Ok(())
}

pub async fn list() -> CliResult<()> {
    let runtime = Runtime::open().await?;
    let entities = runtime.store.list_entities().await?;
    if entities.is_empty() {
        println!("No entities. Run `rondo onboard` or `rondo entity add`.");
        return Ok(());
    }

    println!("{:>4}  {:<24} {:>8}  {:<32} {:>10}  act", "id", "name", "speed", "thinking_type", "clock");
    for entity in entities {
        let (clock, can_act) = match runtime.store.get_timeline(entity.id).await? {
            Some(t) => (format!("{:.4}", t.next_turn), if t.can_act { "yes" } else { "no" }),
            None => ("-".to_string(), "-"),
        };
        println!(
            "{:>4}  {:<24} {:>8}  {:<32} {:>10}  {can_act}",
            entity.id, entity.name, entity.speed, entity.thinking_type, clock
        );
    }
    Ok(())
}
