use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use magpie_core::{EngineConfig, EventBus, CancellationRegistry, Services, WorkflowDriver};
use magpie_extract::{ContentExtractor, ExtractedPage, SearchBackend, SearchHit, SearchQuery};
use magpie_providers::{ChatCompletion, ChatRequest, Provider, ToolCallRequest};
use magpie_queue::{JobContext, JobQueue, MemoryBroker};
use magpie_store::{StatusUpdate, Store};
use magpie_types::{
    JobData, JobRecord, JobState, ReportDraft, ResearchEventKind, ResearchParameters,
    ResearchSession, SessionStatus,
};

const REPORT_MD: &str = "# Impact of AI on Healthcare Diagnostics\n\n\
## Executive Summary\n\n\
AI-assisted diagnostics improve detection rates while raising validation concerns.\n\n\
## Key Findings\n\n\
1. **Accuracy:** [Finding A](https://a.example) shows improved sensitivity.\n\
2. **Validation:** [Finding B](https://b.example) highlights regulatory gaps.\n\n\
## Discussion\n\n\
Deployment is growing across radiology and pathology.\n\n\
## References\n\n\
1. [Finding A](https://a.example)\n\
2. [Finding B](https://b.example)\n";

struct ScriptedProvider {
    replies: Mutex<Vec<ChatCompletion>>,
    fail_always: bool,
}

impl ScriptedProvider {
    fn new(replies: Vec<ChatCompletion>) -> Self {
        Self {
            replies: Mutex::new(replies),
            fail_always: false,
        }
    }

    fn failing() -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            fail_always: true,
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn label(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: ChatRequest) -> anyhow::Result<ChatCompletion> {
        if self.fail_always {
            anyhow::bail!("llm endpoint unreachable");
        }
        let mut replies = self.replies.lock().expect("lock");
        if replies.is_empty() {
            Ok(ChatCompletion {
                text: "done".to_string(),
                ..Default::default()
            })
        } else {
            Ok(replies.remove(0))
        }
    }
}

fn tool_call(name: &str, arguments: serde_json::Value) -> ChatCompletion {
    ChatCompletion {
        text: String::new(),
        tool_calls: vec![ToolCallRequest {
            id: "call".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }],
        usage: None,
    }
}

fn final_answer(text: &str) -> ChatCompletion {
    ChatCompletion {
        text: text.to_string(),
        ..Default::default()
    }
}

fn store_source_call(url: &str) -> ChatCompletion {
    tool_call(
        "database_tool",
        json!({
            "action": "store",
            "data_type": "extracted_content",
            "content": format!("Extracted article body from {url}."),
            "title": "An article",
            "metadata": {"url": url, "summary": "article summary"},
            "relevance_score": 0.9,
        }),
    )
}

struct StubSearch;

#[async_trait]
impl SearchBackend for StubSearch {
    async fn search(&self, _query: &SearchQuery) -> anyhow::Result<Vec<SearchHit>> {
        Ok(Vec::new())
    }
}

struct StubExtractor;

#[async_trait]
impl ContentExtractor for StubExtractor {
    async fn extract(&self, url: &str) -> ExtractedPage {
        ExtractedPage::failure(url, "not used in this test")
    }
}

async fn services_with(provider: Arc<dyn Provider>) -> Services {
    Services {
        config: EngineConfig::default(),
        store: Arc::new(Store::in_memory().await.expect("store")),
        provider,
        search: Arc::new(StubSearch),
        extractor: Arc::new(StubExtractor),
        bus: EventBus::new(),
        cancellations: CancellationRegistry::new(),
    }
}

fn parameters() -> ResearchParameters {
    ResearchParameters {
        max_sources: 10,
        min_sources: 1,
        ..Default::default()
    }
}

async fn seeded_session(services: &Services) -> ResearchSession {
    let session = ResearchSession::new(
        "user-1",
        "Impact of AI on healthcare diagnostics",
        parameters(),
    );
    services
        .store
        .create_session(&session)
        .await
        .expect("create session");
    session
}

fn job_for(session: &ResearchSession, attempts: u32) -> JobRecord {
    JobRecord {
        id: session.id.clone(),
        data: JobData {
            topic: session.topic.clone(),
            parameters: session.parameters.clone(),
            user_id: session.user_id.clone(),
        },
        state: JobState::Active,
        attempts,
        max_attempts: 3,
        backoff_base_ms: 1,
        progress: 0,
        phase: None,
        timeout_ms: 60_000,
        priority: 0,
        enqueued_at: chrono::Utc::now(),
        last_error: None,
    }
}

fn context_for(session: &ResearchSession, cancel: CancellationToken) -> JobContext {
    let queue = JobQueue::new(Arc::new(MemoryBroker::new()), "research");
    JobContext::new(queue, session.id.clone(), cancel)
}

fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<magpie_types::ResearchEvent>,
) -> Vec<magpie_types::ResearchEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn happy_path_completes_with_report_sources_and_citations() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        store_source_call("https://a.example"),
        final_answer("analysis recap: one strong source, no contradictions"),
        final_answer(REPORT_MD),
    ]));
    let services = services_with(provider).await;
    let session = seeded_session(&services).await;
    let mut rx = services.bus.subscribe();

    let driver = WorkflowDriver::new(services.clone());
    driver
        .run(&job_for(&session, 1), &context_for(&session, CancellationToken::new()))
        .await
        .expect("workflow");

    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Completed);
    let report_id = loaded.report_id.expect("report id");

    let report = services
        .store
        .get_report(&report_id)
        .await
        .expect("get report")
        .expect("report");
    assert!(report.content.contains("## Executive Summary"));
    assert!(report.content.contains("## Key Findings"));
    assert!(!report.summary.is_empty());
    assert_eq!(report.key_findings.len(), 2);
    assert!(report.word_count > 0);

    let citations = services
        .store
        .list_citations(&report_id)
        .await
        .expect("citations");
    let positions: Vec<u32> = citations.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1]);
    assert_eq!(citations[0].quote, "Finding A");
    assert!(citations[0].source_id.is_some(), "stored source resolves by url");
    assert!(citations[1].source_id.is_none(), "uncollected url stays unresolved");

    let sources = services
        .store
        .list_sources(&session.id)
        .await
        .expect("sources");
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].url, "https://a.example");

    let events = drain_events(&mut rx);
    let kinds: Vec<ResearchEventKind> = events.iter().map(|e| e.kind).collect();
    assert!(kinds.contains(&ResearchEventKind::SourceFound));
    assert!(kinds.contains(&ResearchEventKind::PartialReport));
    assert!(kinds.contains(&ResearchEventKind::ResearchComplete));
    // every source_found url has a Source row at completion time
    for event in events.iter().filter(|e| e.kind == ResearchEventKind::SourceFound) {
        let url = event.payload["url"].as_str().expect("url");
        assert!(sources.iter().any(|s| s.url == url));
    }
    let progress: Vec<u64> = events
        .iter()
        .filter(|e| e.kind == ResearchEventKind::ProgressUpdate)
        .filter_map(|e| e.payload["percent"].as_u64())
        .collect();
    assert_eq!(progress, vec![0, 33, 66, 100]);
}

#[tokio::test]
async fn provider_outage_fails_session_only_on_final_attempt() {
    let services = services_with(Arc::new(ScriptedProvider::failing())).await;
    let session = seeded_session(&services).await;
    let driver = WorkflowDriver::new(services.clone());

    // first attempt: error is rethrown, session stays processing for retry
    let err = driver
        .run(&job_for(&session, 1), &context_for(&session, CancellationToken::new()))
        .await
        .expect_err("must fail");
    assert!(err.to_string().contains("unreachable"));
    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Processing);

    // final attempt: session is marked failed, no report row exists
    driver
        .run(&job_for(&session, 3), &context_for(&session, CancellationToken::new()))
        .await
        .expect_err("must fail");
    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Failed);
    assert!(loaded.error_message.expect("error").contains("unreachable"));
    assert!(services
        .store
        .get_report_by_session(&session.id)
        .await
        .expect("report query")
        .is_none());
}

#[tokio::test]
async fn cancellation_produces_cancelled_session_without_report() {
    let services = services_with(Arc::new(ScriptedProvider::new(vec![final_answer(
        "never consumed",
    )])))
    .await;
    let session = seeded_session(&services).await;
    let mut rx = services.bus.subscribe();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let driver = WorkflowDriver::new(services.clone());
    driver
        .run(&job_for(&session, 1), &context_for(&session, cancel))
        .await
        .expect("cancellation is not an error");

    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Cancelled);
    assert!(loaded.report_id.is_none());
    assert!(services
        .store
        .get_report_by_session(&session.id)
        .await
        .expect("report query")
        .is_none());

    let events = drain_events(&mut rx);
    assert!(!events
        .iter()
        .any(|e| e.kind == ResearchEventKind::ResearchComplete));
}

#[tokio::test]
async fn malformed_report_gets_exactly_one_repair_pass() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        store_source_call("https://a.example"),
        final_answer("analysis recap"),
        final_answer("this is not a structured report at all"),
        final_answer(REPORT_MD),
    ]));
    let services = services_with(provider).await;
    let session = seeded_session(&services).await;

    let driver = WorkflowDriver::new(services.clone());
    driver
        .run(&job_for(&session, 1), &context_for(&session, CancellationToken::new()))
        .await
        .expect("repair succeeds");

    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Completed);
}

#[tokio::test]
async fn unrepairable_report_fails_the_session() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        store_source_call("https://a.example"),
        final_answer("analysis recap"),
        final_answer("draft without sections"),
        final_answer("repair also without sections"),
    ]));
    let services = services_with(provider).await;
    let session = seeded_session(&services).await;

    let driver = WorkflowDriver::new(services.clone());
    let err = driver
        .run(&job_for(&session, 3), &context_for(&session, CancellationToken::new()))
        .await
        .expect_err("must fail validation");
    assert!(err.to_string().contains("validation"));

    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Failed);
    assert!(services
        .store
        .get_report_by_session(&session.id)
        .await
        .expect("report query")
        .is_none());
}

#[tokio::test]
async fn existing_report_is_adopted_after_worker_crash() {
    // simulate a crash between report persistence and the status flip
    let services = services_with(Arc::new(ScriptedProvider::failing())).await;
    let session = seeded_session(&services).await;
    services
        .store
        .update_status(&session.id, SessionStatus::Processing, StatusUpdate::default())
        .await
        .expect("processing");
    let draft = ReportDraft {
        content: REPORT_MD.to_string(),
        summary: "seeded".to_string(),
        key_findings: vec!["finding".to_string()],
        sources: Vec::new(),
        citations: Vec::new(),
    };
    let existing = services
        .store
        .save_report(&session.id, &draft)
        .await
        .expect("save");

    let driver = WorkflowDriver::new(services.clone());
    driver
        .run(&job_for(&session, 2), &context_for(&session, CancellationToken::new()))
        .await
        .expect("idempotent completion never calls the provider");

    let loaded = services
        .store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("session");
    assert_eq!(loaded.status, SessionStatus::Completed);
    assert_eq!(loaded.report_id.as_deref(), Some(existing.id.as_str()));
    let adopted = services
        .store
        .get_report_by_session(&session.id)
        .await
        .expect("get")
        .expect("report");
    assert_eq!(adopted.id, existing.id, "no duplicate report row");
}
