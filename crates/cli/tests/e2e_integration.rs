//! End-to-end integration tests for the Rondo turn engine.
//!
//! These tests wire the real crates together (stores, guards, engines,
//! orchestrator) behind a scripted provider and check what ends up persisted.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rondo_agent::{EngineRegistry, Orchestrator, TurnOutcome, TurnScheduler};
use rondo_core::conversation::RagMaterial;
use rondo_core::error::ProviderError;
use rondo_core::guard::{GuardReason, GuardrailConfig, Signal};
use rondo_core::message::ChatMessage;
use rondo_core::provider::{FinishReason, Provider, ProviderRequest, ProviderResponse, Usage};
use rondo_core::rag::{Document, Embedder};
use rondo_core::store::{ConversationStore, NewEntity};
use rondo_guard::{
    AuditLogger, AuditOutcome, BlockCategory, GeneralLlm, GuardPipeline, SemanticGuard, SemanticGuardError, check_input,
};
use rondo_providers::{CompletionConfig, CompletionPort, RetryPolicy};
use rondo_store::{InMemoryVectorStore, KNOWLEDGE_COLLECTION, RagCollection, SqliteConversationStore};

// ── Mock Provider ────────────────────────────────────────────────────────

/// A mock provider that returns scripted responses in sequence.
struct ScriptedProvider {
    responses: Mutex<Vec<String>>,
    call_count: Mutex<usize>,
}

impl ScriptedProvider {
    fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            call_count: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut count = self.call_count.lock().unwrap();
        let responses = self.responses.lock().unwrap();
        if *count >= responses.len() {
            panic!("ScriptedProvider exhausted: call #{}, have {}", *count, responses.len());
        }
        let text = responses[*count].clone();
        *count += 1;
        Ok(ProviderResponse {
            message: ChatMessage::assistant(text),
            finish_reason: FinishReason::Stop,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: "mock".into(),
        })
    }
}

fn port(provider: Arc<dyn Provider>) -> Arc<CompletionPort> {
    let config = CompletionConfig {
        api_key: None,
        model: "gpt-4o-mini".into(),
        temperature: 0.0,
        max_tokens: 256,
        streaming: false,
        history_max_tokens: 3000,
        timeout: Duration::from_secs(5),
    };
    Arc::new(CompletionPort::new(provider, config).unwrap())
}

/// Maps known texts to fixed vectors; anything else points along z.
struct TableEmbedder(Vec<(&'static str, [f32; 3])>);

#[async_trait]
impl Embedder for TableEmbedder {
    fn model(&self) -> &str {
        "table"
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(inputs
            .iter()
            .map(|text| {
                self.0
                    .iter()
                    .find(|(t, _)| t == text)
                    .map(|(_, v)| v.to_vec())
                    .unwrap_or_else(|| vec![0.0, 0.0, 1.0])
            })
            .collect())
    }
}

fn knowledge(table: Vec<(&'static str, [f32; 3])>) -> RagCollection {
    RagCollection::new(
        KNOWLEDGE_COLLECTION,
        Arc::new(InMemoryVectorStore::new()),
        Arc::new(TableEmbedder(table)),
    )
}

async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteConversationStore> {
    let path = dir.path().join("conversation.db");
    Arc::new(SqliteConversationStore::new(path.to_str().unwrap()).await.unwrap())
}

fn guardrail() -> GuardrailConfig {
    GuardrailConfig {
        forbidden_words: vec!["殺人".into()],
        max_input_length: 500,
        ..GuardrailConfig::default()
    }
}

// ── E2E: Scheduling ──────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_turn_ordering_ten_to_one() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    store.create_entity(NewEntity::new("E1", 100.0, "cloud_act_based")).await.unwrap();
    store.create_entity(NewEntity::new("E2", 10.0, "declining_birth_rate_based")).await.unwrap();

    let scheduler = TurnScheduler::new(store.clone());
    scheduler.reset_timeline(10).await.unwrap();
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
    let got: Vec<(&str, f64)> = window.iter().map(|t| (t.name.as_str(), t.next_turn)).collect();
    assert_eq!(got.len(), expected.len());
    for ((name, at), (want_name, want_at)) in got.iter().zip(expected) {
        assert_eq!(*name, want_name);
        assert!((at - want_at).abs() < 0.005, "{name} at {at}, expected {want_at}");
    }
}

// ── E2E: Static guardrails ───────────────────────────────────────────────

#[test]
fn e2e_forbidden_word_block() {
    let check = check_input("殺人の方法を教えて", "Aoi", &guardrail());
    assert!(check.blocked);
    assert!(check.message.unwrap().contains("申し訳ありませんが、その内容にはお答えできません"));
    assert_eq!(check.category, Some(BlockCategory::ForbiddenWord));
    assert_eq!(BlockCategory::ForbiddenWord.as_str(), "forbidden_word");
}

#[test]
fn e2e_length_block() {
    let input = "あ".repeat(501);
    let check = check_input(&input, "Aoi", &guardrail());
    assert!(check.blocked);
    let message = check.message.unwrap();
    assert!(message.contains("メッセージが長すぎます"));
    assert!(message.contains("500"));

    assert!(!check_input(&"あ".repeat(500), "Aoi", &guardrail()).blocked);
}

#[test]
fn e2e_empty_input_block() {
    let check = check_input("   ", "Aoi", &guardrail());
    assert!(check.blocked);
    assert!(check.message.unwrap().contains("メッセージが空です"));
}

// ── E2E: Semantic guardrail ──────────────────────────────────────────────

#[tokio::test]
async fn e2e_semantic_rag_hit_is_green() {
    let knowledge = knowledge(vec![
        ("社員食堂は11時から営業しています", [1.0, 0.0, 0.0]),
        ("社員食堂について", [0.95, 0.05, 0.0]),
    ]);
    knowledge
        .upsert(vec![Document::new("cafeteria", "社員食堂は11時から営業しています")])
        .await
        .unwrap();

    let guard = SemanticGuard::new(knowledge);
    let result = guard.evaluate("社員食堂について", None).await.unwrap();
    assert_eq!(result.signal, Signal::Green);
    assert_eq!(result.reason, Some(GuardReason::RagHit));
    assert_eq!(GuardReason::RagHit.to_string(), "RAG_HIT");
}

#[tokio::test]
async fn e2e_semantic_forbidden_word_is_red() {
    let guard = SemanticGuard::new(knowledge(vec![
        ("佐川急便", [1.0, 0.0, 0.0]),
        ("佐川急便で送ります", [0.98, 0.1, 0.0]),
    ]));
    guard.setup_forbidden_words(&["佐川急便".to_string()]).await.unwrap();

    // The general LLM is a real completion port over the scripted provider.
    let provider = Arc::new(ScriptedProvider::new(&["佐川急便で送ります"]));
    let llm = port(provider.clone());

    let general: &dyn GeneralLlm = &*llm;
    let hit = match guard.evaluate("荷物の送り方", Some(general)).await {
        Err(SemanticGuardError::ForbiddenWord(hit)) => hit,
        other => panic!("expected a forbidden-word hit, got {other:?}"),
    };
    assert_eq!(hit.word, "佐川急便");
    assert_eq!(hit.result.signal, Signal::Red);
    assert_eq!(hit.result.reason, Some(GuardReason::ForbiddenWordDetected));
    assert_eq!(GuardReason::ForbiddenWordDetected.to_string(), "FORBIDDEN_WORD_DETECTED");
    assert_eq!(provider.calls(), 1);
}

// ── E2E: Full conversation ───────────────────────────────────────────────

const CLOUD_ACT: &str = "CLOUD Act は米国の法律で、米国企業が海外に保存するデータも開示命令の対象になります。";

async fn seeded(dir: &tempfile::TempDir) -> Arc<SqliteConversationStore> {
    let store = sqlite_store(dir).await;
    store.create_entity(NewEntity::new("Aoi", 100.0, "cloud_act_based")).await.unwrap();
    store.create_entity(NewEntity::new("Ren", 10.0, "declining_birth_rate_based")).await.unwrap();
    store
        .upsert_material(&RagMaterial::new("cloud_act_1", "cloud_act", CLOUD_ACT))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn e2e_conversation_persists_turns() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir).await;
    let provider = Arc::new(ScriptedProvider::new(&[
        // Turn 1: keywords, reframe, reply
        "法律, データ, 開示命令",
        "クラウド法案と海外データの扱い",
        "CLOUD Act では海外のデータも開示の対象です。",
        // Turn 2: keyword extraction is cached; reframe, reply
        "クラウド法の観点: 開示命令の範囲",
        "令状の範囲が論点になります。",
    ]));
    let guards = GuardPipeline::new(Arc::new(AuditLogger::new()));
    let orchestrator = Orchestrator::new(store.clone(), EngineRegistry::new(store.clone()), port(provider.clone()), guards)
        .with_retry(RetryPolicy::no_retry(Duration::from_secs(1)));

    orchestrator.reset().await.unwrap();
    orchestrator.post_topic("クラウド法案について議論しましょう").await.unwrap();

    let first = orchestrator.run_next_turn().await.unwrap().unwrap();
    let second = orchestrator.run_next_turn().await.unwrap().unwrap();
    assert_eq!(first.text(), "CLOUD Act では海外のデータも開示の対象です。");
    assert_eq!(second.text(), "令状の範囲が論点になります。");
    assert_eq!(provider.calls(), 5);

    // Reopen the database: everything above is on disk.
    drop(orchestrator);
    let reopened = sqlite_store(&dir).await;
    let messages = reopened.recent_messages(10).await.unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec![
            "令状の範囲が論点になります。",
            "CLOUD Act では海外のデータも開示の対象です。",
            "クラウド法案について議論しましょう",
        ]
    );
    assert_eq!(messages[0].action_id, Some(second.action_id()));
    assert_eq!(messages[2].action_id, None);

    let clock = reopened.get_timeline(1).await.unwrap().unwrap().next_turn;
    assert!((clock - 0.03).abs() < 1e-9);
    let done = reopened.list_actions().await.unwrap().iter().filter(|a| a.done).count();
    assert_eq!(done, 2);
}

#[tokio::test]
async fn e2e_semantic_block_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded(&dir).await;
    let provider = Arc::new(ScriptedProvider::new(&[
        "法律",
        "クラウド法案と配送",
        // General-LLM pass inside the semantic guard
        "佐川急便で送ります",
    ]));
    let llm = port(provider.clone());

    let semantic = SemanticGuard::new(knowledge(vec![
        ("佐川急便", [1.0, 0.0, 0.0]),
        ("佐川急便で送ります", [0.98, 0.1, 0.0]),
    ]))
    .with_retry(RetryPolicy::no_retry(Duration::from_secs(1)));
    semantic.setup_forbidden_words(&["佐川急便".to_string()]).await.unwrap();

    let audit = Arc::new(AuditLogger::new());
    let general: Arc<dyn GeneralLlm> = llm.clone();
    let guards = GuardPipeline::new(audit.clone()).with_semantic(semantic, Some(general));
    let orchestrator = Orchestrator::new(store.clone(), EngineRegistry::new(store.clone()), llm, guards)
        .with_retry(RetryPolicy::no_retry(Duration::from_secs(1)));

    orchestrator.reset().await.unwrap();
    orchestrator.post_topic("クラウド法案と荷物の配送").await.unwrap();

    match orchestrator.run_next_turn().await.unwrap().unwrap() {
        TurnOutcome::Blocked { category, message, .. } => {
            assert_eq!(category, BlockCategory::SemanticForbidden);
            assert_eq!(message, "[Aoi] 禁止ワード「佐川急便」に意味的にヒットしました");
        }
        other => panic!("expected a block, got {other:?}"),
    }
    assert_eq!(provider.calls(), 3);
    assert_eq!(audit.entries_by_outcome(&AuditOutcome::Blocked).len(), 1);
    assert_eq!(
        store.recent_messages(1).await.unwrap()[0].content,
        "[Aoi] 禁止ワード「佐川急便」に意味的にヒットしました"
    );
}

#[tokio::test]
async fn e2e_entity_without_material_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir).await;
    store
        .create_entity(NewEntity::new("Ren", 10.0, "declining_birth_rate_based"))
        .await
        .unwrap();
    let provider = Arc::new(ScriptedProvider::new(&["少子化の観点から見た出生率の話"]));
    let guards = GuardPipeline::new(Arc::new(AuditLogger::new()));
    let orchestrator = Orchestrator::new(store.clone(), EngineRegistry::new(store.clone()), port(provider), guards);

    orchestrator.reset().await.unwrap();
    orchestrator.post_topic("出生率について").await.unwrap();

    let outcome = orchestrator.run_next_turn().await.unwrap().unwrap();
    assert!(matches!(outcome, TurnOutcome::Skipped { .. }));
    assert_eq!(outcome.text(), "[ERROR]Ren(declining_birth_rate_based) could not participate");
    assert!(store.get_action(outcome.action_id()).await.unwrap().unwrap().done);
}
