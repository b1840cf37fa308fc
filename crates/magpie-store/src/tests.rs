use super::*;
use magpie_types::{
    CitationDraft, ReportLength, ResearchDepth, ResearchParameters, SourceDraft,
};
use serde_json::json;

fn params_fixture() -> ResearchParameters {
    ResearchParameters {
        max_sources: 10,
        min_sources: 3,
        report_length: ReportLength::Medium,
        depth: ResearchDepth::Standard,
        language: "en".to_string(),
        allowed_domains: None,
        blocked_domains: None,
        date_range: None,
    }
}

async fn store_with_session() -> (Store, ResearchSession) {
    let store = Store::in_memory().await.expect("store");
    let session = ResearchSession::new("user-1", "Impact of AI on healthcare diagnostics", params_fixture());
    store.create_session(&session).await.expect("create");
    (store, session)
}

fn draft_fixture() -> ReportDraft {
    ReportDraft {
        content: "# Title\n\n## Executive Summary\n\nBody.\n\n## Key Findings\n\n1. **One:** a\n\n## References\n\n1. [A](https://a.example)".to_string(),
        summary: "Body.".to_string(),
        key_findings: vec!["One: a".to_string()],
        sources: vec![
            SourceDraft {
                url: "https://a.example".to_string(),
                title: "A".to_string(),
                content: "content a".to_string(),
                summary: "sum a".to_string(),
                relevance_score: 0.8,
                metadata: Some(json!({"author": "someone"})),
            },
            SourceDraft {
                url: "https://b.example".to_string(),
                title: "B".to_string(),
                content: "content b".to_string(),
                summary: "sum b".to_string(),
                relevance_score: 0.4,
                metadata: None,
            },
        ],
        citations: vec![
            CitationDraft {
                quote: "Finding A".to_string(),
                context: None,
                source_url: Some("https://a.example".to_string()),
            },
            CitationDraft {
                quote: "Finding B".to_string(),
                context: Some("see also".to_string()),
                source_url: Some("https://b.example".to_string()),
            },
        ],
    }
}

#[tokio::test]
async fn session_roundtrip_preserves_parameters() {
    let (store, session) = store_with_session().await;
    let loaded = store
        .get_session(&session.id)
        .await
        .expect("get")
        .expect("present");
    assert_eq!(loaded.topic, session.topic);
    assert_eq!(loaded.parameters, session.parameters);
    assert_eq!(loaded.status, SessionStatus::Pending);
}

#[tokio::test]
async fn status_machine_is_enforced() {
    let (store, session) = store_with_session().await;

    let updated = store
        .update_status(&session.id, SessionStatus::Processing, StatusUpdate::default())
        .await
        .expect("to processing");
    assert!(updated.started_at.is_some());

    let err = store
        .update_status(&session.id, SessionStatus::Pending, StatusUpdate::default())
        .await
        .expect_err("processing back to pending must fail");
    assert!(matches!(err, StoreError::IllegalTransition { .. }));

    let done = store
        .update_status(
            &session.id,
            SessionStatus::Completed,
            StatusUpdate {
                report_id: Some("r-1".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("to completed");
    assert!(done.completed_at.is_some());
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());
    assert_eq!(done.report_id.as_deref(), Some("r-1"));
}

#[tokio::test]
async fn same_status_update_is_a_noop() {
    let (store, session) = store_with_session().await;
    store
        .update_status(&session.id, SessionStatus::Processing, StatusUpdate::default())
        .await
        .expect("first");
    store
        .update_status(&session.id, SessionStatus::Processing, StatusUpdate::default())
        .await
        .expect("requeued worker must not error");
}

#[tokio::test]
async fn save_report_is_transactional_and_idempotent() {
    let (store, session) = store_with_session().await;
    let draft = draft_fixture();

    let first = store.save_report(&session.id, &draft).await.expect("save");
    let second = store.save_report(&session.id, &draft).await.expect("resave");
    assert_eq!(first.id, second.id, "existing report must be adopted, not duplicated");

    let citations = store.list_citations(&first.id).await.expect("citations");
    let positions: Vec<u32> = citations.iter().map(|c| c.position).collect();
    assert_eq!(positions, vec![0, 1], "positions contiguous from zero");
    assert!(citations[0].source_id.is_some());

    let sources = store.list_sources(&session.id).await.expect("sources");
    assert_eq!(sources.len(), 2);
}

#[tokio::test]
async fn duplicate_source_urls_collapse_per_session() {
    let (store, session) = store_with_session().await;
    let mut draft = draft_fixture();
    draft.sources.push(SourceDraft {
        url: "https://a.example".to_string(),
        title: "A updated".to_string(),
        content: "newer".to_string(),
        summary: "newer".to_string(),
        relevance_score: 0.9,
        metadata: None,
    });
    store.save_report(&session.id, &draft).await.expect("save");
    let sources = store.list_sources(&session.id).await.expect("sources");
    assert_eq!(sources.len(), 2, "(session_id, url) must stay unique");
}

#[tokio::test]
async fn research_data_dedups_by_content_hash() {
    let (store, session) = store_with_session().await;
    let draft = ResearchDataDraft {
        query: Some("solid state batteries".to_string()),
        title: Some("page".to_string()),
        content: "identical body".to_string(),
        metadata: Some(json!({"url": "https://a.example"})),
        relevance_score: Some(0.7),
    };
    let first = store
        .append_research_data(&session.id, ResearchDataType::ExtractedContent, &draft)
        .await
        .expect("insert");
    assert!(first.is_some());
    let second = store
        .append_research_data(&session.id, ResearchDataType::ExtractedContent, &draft)
        .await
        .expect("dup insert");
    assert!(second.is_none(), "duplicate content must be dropped");

    let count = store
        .count_research_data(&session.id, ResearchDataType::ExtractedContent)
        .await
        .expect("count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn research_summary_aggregates_sources_and_queries() {
    let (store, session) = store_with_session().await;
    for i in 0..3 {
        let draft = ResearchDataDraft {
            query: Some(format!("query {}", i % 2)),
            title: Some(format!("title {i}")),
            content: format!("body {i}"),
            metadata: Some(json!({"url": format!("https://s{i}.example")})),
            relevance_score: Some(0.5 + f64::from(i) * 0.1),
        };
        store
            .append_research_data(&session.id, ResearchDataType::ExtractedContent, &draft)
            .await
            .expect("insert");
    }
    let summary = store.research_summary(&session.id).await.expect("summary");
    assert_eq!(summary.total_sources, 3);
    assert_eq!(summary.distinct_queries, 2);
    assert_eq!(summary.top_sources.len(), 3);
    assert_eq!(
        summary.top_sources[0].url.as_deref(),
        Some("https://s2.example"),
        "most relevant first"
    );
}

#[tokio::test]
async fn purge_respects_grace_period() {
    let (store, session) = store_with_session().await;
    let draft = ResearchDataDraft {
        content: "scratch".to_string(),
        ..Default::default()
    };
    store
        .append_research_data(&session.id, ResearchDataType::Analysis, &draft)
        .await
        .expect("insert");
    store
        .update_status(&session.id, SessionStatus::Processing, StatusUpdate::default())
        .await
        .expect("processing");
    store
        .update_status(&session.id, SessionStatus::Cancelled, StatusUpdate::default())
        .await
        .expect("cancelled");

    let removed = store
        .purge_research_data(chrono::Duration::hours(1))
        .await
        .expect("purge");
    assert_eq!(removed, 0, "rows inside the grace window survive");

    let removed = store
        .purge_research_data(chrono::Duration::seconds(-5))
        .await
        .expect("purge past grace");
    assert_eq!(removed, 1);
}

#[tokio::test]
async fn cascade_delete_removes_children() {
    let (store, session) = store_with_session().await;
    store
        .save_report(&session.id, &draft_fixture())
        .await
        .expect("save");
    store
        .append_research_data(
            &session.id,
            ResearchDataType::Analysis,
            &ResearchDataDraft {
                content: "analysis".to_string(),
                ..Default::default()
            },
        )
        .await
        .expect("insert");

    assert!(store.delete_session(&session.id).await.expect("delete"));
    assert!(store
        .get_report_by_session(&session.id)
        .await
        .expect("report query")
        .is_none());
    assert!(store
        .list_sources(&session.id)
        .await
        .expect("sources")
        .is_empty());
    assert_eq!(
        store
            .count_research_data(&session.id, ResearchDataType::Analysis)
            .await
            .expect("count"),
        0
    );
}

#[tokio::test]
async fn list_sessions_filters_and_paginates() {
    let store = Store::in_memory().await.expect("store");
    for i in 0..5 {
        let mut session =
            ResearchSession::new("user-1", format!("topic number {i}"), params_fixture());
        session.created_at = session.created_at - chrono::Duration::seconds(i);
        store.create_session(&session).await.expect("create");
        if i % 2 == 0 {
            store
                .update_status(&session.id, SessionStatus::Processing, StatusUpdate::default())
                .await
                .expect("processing");
        }
    }
    let (all, total) = store
        .list_sessions("user-1", None, 1, 3)
        .await
        .expect("list");
    assert_eq!(total, 5);
    assert_eq!(all.len(), 3);

    let (processing, processing_total) = store
        .list_sessions("user-1", Some(SessionStatus::Processing), 1, 100)
        .await
        .expect("filtered list");
    assert_eq!(processing_total, 3);
    assert!(processing
        .iter()
        .all(|s| s.status == SessionStatus::Processing));

    let (other_user, _) = store
        .list_sessions("user-2", None, 1, 10)
        .await
        .expect("other user");
    assert!(other_user.is_empty());
}

#[tokio::test]
async fn settings_and_history_roundtrip() {
    let store = Store::in_memory().await.expect("store");
    store
        .put_user_settings("user-1", &json!({"default_depth": "standard"}))
        .await
        .expect("put");
    let settings = store
        .get_user_settings("user-1")
        .await
        .expect("get")
        .expect("present");
    assert_eq!(settings["default_depth"], "standard");

    store
        .record_search_history("user-1", "rust async runtimes", 12)
        .await
        .expect("record");
    let history = store
        .list_search_history("user-1", 10)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].0, "rust async runtimes");
    assert_eq!(history[0].1, 12);
}

#[tokio::test]
async fn open_on_disk_creates_schema() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("magpie.db");
    let store = Store::open(&path).await.expect("open");
    let session = ResearchSession::new("user-1", "a valid topic", params_fixture());
    store.create_session(&session).await.expect("create");
    drop(store);

    let reopened = Store::open(&path).await.expect("reopen");
    assert!(reopened
        .get_session(&session.id)
        .await
        .expect("get")
        .is_some());
}
