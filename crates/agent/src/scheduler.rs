//! Virtual-clock turn scheduler.
//!
//! Every entity owns a clock (`ActionTimeline::next_turn`) that starts at
//! `1/speed` and moves forward by `1/speed` each time the entity takes a
//! turn, so faster entities act more often. The next actor is always the one
//! with the smallest `(next_turn, entity_id)`.
//!
//! [`TurnScheduler::simulate_next_actions`] projects a window of future turns
//! over a copy of the clocks and materializes it as pending
//! [`ActionHistory`](rondo_core::ActionHistory) rows. The persisted clocks only
//! move after a turn has been taken, through [`TurnScheduler::advance_clock`]
//! or the store's `complete_action` with [`TurnScheduler::next_clock`].

use std::sync::Arc;

use rondo_core::conversation::{ActionTimeline, Entity, EntityId};
use rondo_core::store::ConversationStore;
use rondo_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Clock values closer than this are treated as equal.
pub const CLOCK_EPSILON: f64 = 1e-9;

/// Window materialized by [`TurnScheduler::reset_timeline`].
pub const DEFAULT_SIMULATE_STEPS: usize = 10;

/// One projected turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTurn {
    pub entity_id: EntityId,
    pub name: String,
    /// Clock value at which the entity acts.
    pub next_turn: f64,
    pub action_id: i64,
    pub acted_at_turn: i64,
}

/// `1/speed`; speeds must be positive and finite.
pub fn calculate_next_turn_increment(speed: f64) -> Result<f64> {
    if !(speed.is_finite() && speed > 0.0) {
        return Err(Error::invalid_config(format!("speed must be positive, got {speed}")));
    }
    Ok(1.0 / speed)
}

/// Index of the next actor among `(next_turn, entity_id)` clocks.
///
/// Ties are measured against the smallest clock, not pairwise, so a chain of
/// clocks each within epsilon of its neighbour cannot drag a later clock in.
/// Among the clocks within epsilon of the minimum the lowest entity id wins.
fn next_actor(clocks: &[(f64, EntityId)]) -> Option<usize> {
    let front = clocks.iter().map(|c| c.0).min_by(f64::total_cmp)?;
    clocks
        .iter()
        .enumerate()
        .filter(|(_, c)| c.0 - front <= CLOCK_EPSILON)
        .min_by_key(|(_, c)| c.1)
        .map(|(i, _)| i)
}

pub struct TurnScheduler {
    store: Arc<dyn ConversationStore>,
}

impl TurnScheduler {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self { store }
    }

    /// Set every entity's clock to `1/speed`, creating timelines as needed.
    /// An existing `can_act` flag is kept.
    pub async fn initialize_timeline(&self) -> Result<usize> {
        let entities = self.store.list_entities().await?;
        for entity in &entities {
            let can_act = self
                .store
                .get_timeline(entity.id)
                .await?
                .map_or(true, |t| t.can_act);
            let timeline = ActionTimeline {
                entity_id: entity.id,
                next_turn: calculate_next_turn_increment(entity.speed)?,
                can_act,
            };
            self.store.save_timeline(&timeline).await?;
        }
        debug!(entities = entities.len(), "Timelines initialized");
        Ok(entities.len())
    }

    /// Start the conversation over: drop messages and actions, reset the
    /// clocks, and materialize the first window as pending actions.
    pub async fn reset_timeline(&self, steps: usize) -> Result<Vec<ScheduledTurn>> {
        self.store.delete_all_messages().await?;
        self.store.delete_all_actions().await?;
        self.initialize_timeline().await?;
        let window = self.simulate_next_actions(steps).await?;
        self.store.reset_actions_pending().await?;
        info!(steps = window.len(), "Timeline reset");
        Ok(window)
    }

    /// Project `max_steps` turns from the persisted clocks and create one
    /// pending action per turn. Only entities whose timeline exists and has
    /// `can_act` participate. The persisted clocks are not modified.
    pub async fn simulate_next_actions(&self, max_steps: usize) -> Result<Vec<ScheduledTurn>> {
        let entities = self.store.list_entities().await?;
        let mut clocks: Vec<(Entity, f64, f64)> = Vec::with_capacity(entities.len());
        for entity in entities {
            let Some(timeline) = self.store.get_timeline(entity.id).await? else {
                continue;
            };
            if !timeline.can_act {
                continue;
            }
            let increment = calculate_next_turn_increment(entity.speed)?;
            clocks.push((entity, timeline.next_turn, increment));
        }
        if clocks.is_empty() {
            return Ok(Vec::new());
        }

        let offset = self
            .store
            .list_actions()
            .await?
            .iter()
            .map(|a| a.acted_at_turn)
            .max()
            .unwrap_or(0);

        let mut window = Vec::with_capacity(max_steps);
        for step in 1..=max_steps {
            let keys: Vec<(f64, EntityId)> = clocks.iter().map(|c| (c.1, c.0.id)).collect();
            let Some(index) = next_actor(&keys) else {
                break;
            };
            let next = &mut clocks[index];
            let acted_at_turn = offset + step as i64;
            let action = self.store.create_action(next.0.id, acted_at_turn).await?;
            window.push(ScheduledTurn {
                entity_id: next.0.id,
                name: next.0.name.clone(),
                next_turn: next.1,
                action_id: action.id,
                acted_at_turn,
            });
            next.1 += next.2;
        }
        debug!(steps = window.len(), "Simulated next actions");
        Ok(window)
    }

    /// `entity`'s timeline one turn ahead, not yet saved.
    pub async fn next_clock(&self, entity: &Entity) -> Result<ActionTimeline> {
        let mut timeline = self.store.get_timeline(entity.id).await?.ok_or_else(|| {
            Error::DataInconsistency(format!("no ActionTimeline for entity {} ({})", entity.id, entity.name))
        })?;
        timeline.next_turn += calculate_next_turn_increment(entity.speed)?;
        Ok(timeline)
    }

    /// Move `entity`'s persisted clock forward by one turn.
    pub async fn advance_clock(&self, entity: &Entity) -> Result<ActionTimeline> {
        let timeline = self.next_clock(entity).await?;
        self.store.save_timeline(&timeline).await?;
        Ok(timeline)
    }

    /// Allow or stop an entity from taking part in future windows.
    pub async fn set_can_act(&self, entity_id: EntityId, can_act: bool) -> Result<()> {
        let mut timeline = self
            .store
            .get_timeline(entity_id)
            .await?
            .ok_or_else(|| Error::DataInconsistency(format!("no ActionTimeline for entity {entity_id}")))?;
        timeline.can_act = can_act;
        self.store.save_timeline(&timeline).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rondo_core::store::NewEntity;
    use rondo_store::InMemoryConversationStore;

    async fn two_entities() -> (Arc<InMemoryConversationStore>, TurnScheduler) {
        let store = Arc::new(InMemoryConversationStore::new());
        store
            .create_entity(NewEntity::new("E1", 100.0, "cloud_act_based"))
            .await
            .unwrap();
        store
            .create_entity(NewEntity::new("E2", 10.0, "declining_birth_rate_based"))
            .await
            .unwrap();
        let scheduler = TurnScheduler::new(store.clone());
        (store, scheduler)
    }

    #[tokio::test]
    async fn ten_to_one_ordering() {
        let (_store, scheduler) = two_entities().await;
        scheduler.reset_timeline(DEFAULT_SIMULATE_STEPS).await.unwrap();
        let window = scheduler.simulate_next_actions(11).await.unwrap();

        let expected = [
            ("E1", 0.01),
            ("E1", 0.02),
            ("E1", 0.03),
            ("E1", 0.04),
            ("E1", 0.05),
            ("E1", 0.06),
            ("E1", 0.07),
            ("E1", 0.08),
            ("E1", 0.09),
            ("E1", 0.10),
            ("E2", 0.10),
        ];
        assert_eq!(window.len(), expected.len());
        for (turn, (name, at)) in window.iter().zip(expected) {
            assert_eq!(turn.name, name);
            assert!((turn.next_turn - at).abs() < 0.005, "{} at {}", turn.name, turn.next_turn);
        }
    }

    #[tokio::test]
    async fn reset_materializes_pending_window() {
        let (store, scheduler) = two_entities().await;
        store.append_message(1, "old", None).await.unwrap();

        let window = scheduler.reset_timeline(DEFAULT_SIMULATE_STEPS).await.unwrap();
        assert_eq!(window.len(), 10);
        assert!(store.recent_messages(5).await.unwrap().is_empty());

        let actions = store.list_actions().await.unwrap();
        assert_eq!(actions.len(), 10);
        assert!(actions.iter().all(|a| !a.done));
        let turns: Vec<i64> = actions.iter().map(|a| a.acted_at_turn).collect();
        assert_eq!(turns, (1..=10).collect::<Vec<_>>());

        // Projection leaves the persisted clock alone.
        assert!((store.get_timeline(1).await.unwrap().unwrap().next_turn - 0.01).abs() < 1e-12);
    }

    #[tokio::test]
    async fn next_window_continues_numbering_and_clocks() {
        let (store, scheduler) = two_entities().await;
        scheduler.reset_timeline(2).await.unwrap();
        let e1 = store.get_entity(1).await.unwrap().unwrap();
        scheduler.advance_clock(&e1).await.unwrap();
        scheduler.advance_clock(&e1).await.unwrap();

        let window = scheduler.simulate_next_actions(1).await.unwrap();
        assert_eq!(window[0].acted_at_turn, 3);
        assert!((window[0].next_turn - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn selection_frequency_follows_speed() {
        let store = Arc::new(InMemoryConversationStore::new());
        store.create_entity(NewEntity::new("fast", 3.0, "x")).await.unwrap();
        store.create_entity(NewEntity::new("slow", 1.0, "x")).await.unwrap();
        let scheduler = TurnScheduler::new(store);
        scheduler.initialize_timeline().await.unwrap();

        let window = scheduler.simulate_next_actions(40).await.unwrap();
        let fast = window.iter().filter(|t| t.name == "fast").count();
        assert_eq!(fast, 30);
    }

    #[tokio::test]
    async fn entities_that_cannot_act_are_skipped() {
        let (_store, scheduler) = two_entities().await;
        scheduler.initialize_timeline().await.unwrap();
        scheduler.set_can_act(1, false).await.unwrap();
        let window = scheduler.simulate_next_actions(3).await.unwrap();
        assert!(window.iter().all(|t| t.name == "E2"));

        // Re-initializing keeps the flag.
        scheduler.initialize_timeline().await.unwrap();
        assert!(scheduler.simulate_next_actions(1).await.unwrap()[0].name == "E2");
    }

    #[tokio::test]
    async fn no_participants_means_empty_window() {
        let store = Arc::new(InMemoryConversationStore::new());
        let scheduler = TurnScheduler::new(store);
        assert!(scheduler.simulate_next_actions(5).await.unwrap().is_empty());
    }

    #[test]
    fn increment_rejects_non_positive_speed() {
        assert!((calculate_next_turn_increment(4.0).unwrap() - 0.25).abs() < f64::EPSILON);
        assert!(matches!(
            calculate_next_turn_increment(0.0),
            Err(Error::InvalidConfig { .. })
        ));
        assert!(calculate_next_turn_increment(-1.0).is_err());
        assert!(calculate_next_turn_increment(f64::NAN).is_err());
    }

    #[test]
    fn ties_break_by_entity_id() {
        assert_eq!(next_actor(&[(0.1, 1), (0.1 + 1e-12, 2)]), Some(0));
        assert_eq!(next_actor(&[(0.1, 2), (0.1, 1)]), Some(1));
        assert_eq!(next_actor(&[(0.09, 2), (0.1, 1)]), Some(0));
        assert_eq!(next_actor(&[]), None);
    }

    #[test]
    fn epsilon_chain_only_ties_with_the_front() {
        // Each clock is within epsilon of its neighbour, but the last one is
        // not within epsilon of the smallest.
        let front = (0.1, 3);
        let near = (0.1 + 0.8e-9, 2);
        let far = (0.1 + 1.6e-9, 1);
        for clocks in [[front, near, far], [far, near, front], [near, far, front], [far, front, near]] {
            let picked = next_actor(&clocks).map(|i| clocks[i].1);
            assert_eq!(picked, Some(2), "order {clocks:?}");
        }
    }
}
