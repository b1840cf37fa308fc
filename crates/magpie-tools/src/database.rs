use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use magpie_store::Store;
use magpie_types::{ResearchDataDraft, ResearchDataType, ResearchEvent};

use crate::{EventSink, FieldKind, FieldSpec, Tool, ToolReply, ToolSchema};

/// Scratchpad access for the agents. `store` is the only side-effecting
/// action in the toolset and is idempotent through content-hash dedup, so
/// retrying it is safe.
pub struct DatabaseTool {
    store: Arc<Store>,
    events: Arc<dyn EventSink>,
    session_id: String,
}

impl DatabaseTool {
    pub fn new(store: Arc<Store>, events: Arc<dyn EventSink>, session_id: String) -> Self {
        Self {
            store,
            events,
            session_id,
        }
    }

    async fn store_row(&self, args: &Value) -> anyhow::Result<ToolReply> {
        let Some(data_type) = args["data_type"]
            .as_str()
            .and_then(ResearchDataType::parse)
        else {
            return ToolReply::failure("unknown data_type");
        };
        let draft = ResearchDataDraft {
            query: args["query"].as_str().map(str::to_string),
            title: args["title"].as_str().map(str::to_string),
            content: args["content"].as_str().unwrap_or_default().to_string(),
            metadata: args.get("metadata").filter(|v| !v.is_null()).cloned(),
            relevance_score: args["relevance_score"].as_f64(),
        };
        let stored = self
            .store
            .append_research_data(&self.session_id, data_type, &draft)
            .await?;
        match stored {
            Some(record) => {
                if data_type.is_source_bearing() {
                    let url = record
                        .metadata
                        .as_ref()
                        .and_then(|meta| meta.get("url"))
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    if !url.is_empty() {
                        self.events.emit(ResearchEvent::source_found(
                            &self.session_id,
                            &url,
                            record.title.as_deref(),
                        ));
                    }
                }
                ToolReply::success(json!({
                    "stored": true,
                    "id": record.id,
                    "data_type": data_type.as_str(),
                }))
            }
            None => ToolReply::success(json!({
                "stored": false,
                "deduplicated": true,
                "data_type": data_type.as_str(),
            })),
        }
    }

    async fn retrieve_sources(&self, args: &Value) -> anyhow::Result<ToolReply> {
        let limit = args["limit"].as_i64().unwrap_or(20).clamp(1, 100) as u32;
        let rows = self
            .store
            .get_research_data(
                &self.session_id,
                Some(ResearchDataType::SourceContent),
                Some(limit),
            )
            .await?;
        // Most sessions store pages as extracted_content; fold both kinds.
        let mut rows = rows;
        if (rows.len() as u32) < limit {
            let remaining = limit - rows.len() as u32;
            rows.extend(
                self.store
                    .get_research_data(
                        &self.session_id,
                        Some(ResearchDataType::ExtractedContent),
                        Some(remaining),
                    )
                    .await?,
            );
        }
        let sources: Vec<Value> = rows
            .iter()
            .map(|row| {
                json!({
                    "id": row.id,
                    "title": row.title,
                    "query": row.query,
                    "content": row.content,
                    "metadata": row.metadata,
                    "relevance_score": row.relevance_score,
                })
            })
            .collect();
        ToolReply::success(json!({"count": sources.len(), "sources": sources}))
    }

    async fn get_summary(&self) -> anyhow::Result<ToolReply> {
        let summary = self.store.research_summary(&self.session_id).await?;
        ToolReply::success(serde_json::to_value(summary)?)
    }
}

#[async_trait]
impl Tool for DatabaseTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "database_tool",
            description: "Persist intermediate research data and read it back. Actions: \
                          `store` saves a row (set data_type and content; put the source \
                          url in metadata.url), `retrieve_sources` returns stored pages \
                          ordered by relevance, `get_summary` reports totals.",
            fields: vec![
                FieldSpec::required(
                    "action",
                    FieldKind::Choice(vec!["store", "retrieve_sources", "get_summary"]),
                    "what to do",
                ),
                FieldSpec::optional(
                    "data_type",
                    FieldKind::Choice(vec![
                        "search_results",
                        "extracted_content",
                        "analysis",
                        "game_plan",
                        "source_content",
                    ]),
                    "row kind (required for store)",
                ),
                FieldSpec::optional(
                    "content",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 200_000,
                    },
                    "row content (required for store)",
                ),
                FieldSpec::optional(
                    "query",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 400,
                    },
                    "query that produced this row",
                ),
                FieldSpec::optional(
                    "title",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 500,
                    },
                    "row title",
                ),
                FieldSpec::optional("metadata", FieldKind::Json, "extra fields such as url"),
                FieldSpec::optional(
                    "relevance_score",
                    FieldKind::Number { min: 0.0, max: 1.0 },
                    "relevance of the row to the topic",
                ),
                FieldSpec::optional(
                    "limit",
                    FieldKind::Integer { min: 1, max: 100 },
                    "max rows for retrieve_sources",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        match args["action"].as_str().unwrap_or_default() {
            "store" => {
                if args["content"].as_str().unwrap_or_default().is_empty() {
                    return ToolReply::failure("store requires non-empty content");
                }
                self.store_row(&args).await
            }
            "retrieve_sources" => self.retrieve_sources(&args).await,
            "get_summary" => self.get_summary().await,
            other => ToolReply::failure(format!("unsupported action `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToolExecution, ToolRegistry};
    use magpie_types::{ResearchEventKind, ResearchParameters, ResearchSession};
    use std::sync::Mutex;

    struct CapturingSink {
        events: Mutex<Vec<ResearchEvent>>,
    }

    impl EventSink for CapturingSink {
        fn emit(&self, event: ResearchEvent) {
            self.events.lock().expect("lock").push(event);
        }
    }

    async fn toolset() -> (ToolRegistry, Arc<Store>, Arc<CapturingSink>, String) {
        let store = Arc::new(Store::in_memory().await.expect("store"));
        let session =
            ResearchSession::new("user-1", "a plausible topic", ResearchParameters::default());
        store.create_session(&session).await.expect("session");
        let sink = Arc::new(CapturingSink {
            events: Mutex::new(Vec::new()),
        });
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DatabaseTool::new(
            store.clone(),
            sink.clone(),
            session.id.clone(),
        )));
        (registry, store, sink, session.id)
    }

    fn store_args(content: &str, url: &str) -> Value {
        json!({
            "action": "store",
            "data_type": "extracted_content",
            "content": content,
            "title": "a page",
            "metadata": {"url": url},
            "relevance_score": 0.8,
        })
    }

    #[tokio::test]
    async fn store_emits_source_found_once() {
        let (registry, _store, sink, session_id) = toolset().await;

        let outcome = registry
            .execute("database_tool", store_args("body text", "https://a.example"))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert_eq!(value["stored"], true);

        // identical content again: deduplicated, no second event
        let outcome = registry
            .execute("database_tool", store_args("body text", "https://a.example"))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert_eq!(value["deduplicated"], true);

        let events = sink.events.lock().expect("lock");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ResearchEventKind::SourceFound);
        assert_eq!(events[0].session_id, session_id);
        assert_eq!(events[0].payload["url"], "https://a.example");
    }

    #[tokio::test]
    async fn retrieve_sources_orders_by_relevance() {
        let (registry, _store, _sink, _session) = toolset().await;
        for (i, score) in [0.2f64, 0.9, 0.5].iter().enumerate() {
            registry
                .execute(
                    "database_tool",
                    json!({
                        "action": "store",
                        "data_type": "extracted_content",
                        "content": format!("page {i}"),
                        "relevance_score": score,
                        "metadata": {"url": format!("https://s{i}.example")},
                    }),
                )
                .await
                .expect("store");
        }
        let outcome = registry
            .execute("database_tool", json!({"action": "retrieve_sources", "limit": 2}))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert_eq!(value["count"], 2);
        assert_eq!(value["sources"][0]["relevance_score"], 0.9);
        assert_eq!(value["sources"][1]["relevance_score"], 0.5);
    }

    #[tokio::test]
    async fn summary_counts_queries_and_sources() {
        let (registry, _store, _sink, _session) = toolset().await;
        registry
            .execute(
                "database_tool",
                json!({
                    "action": "store",
                    "data_type": "extracted_content",
                    "content": "page body",
                    "query": "battery chemistry",
                    "metadata": {"url": "https://a.example"},
                }),
            )
            .await
            .expect("store");
        let outcome = registry
            .execute("database_tool", json!({"action": "get_summary"}))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert_eq!(value["total_sources"], 1);
        assert_eq!(value["distinct_queries"], 1);
    }

    #[tokio::test]
    async fn store_without_content_is_a_failure_observation() {
        let (registry, _store, _sink, _session) = toolset().await;
        let outcome = registry
            .execute("database_tool", json!({"action": "store", "data_type": "analysis"}))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Failure(reason)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert!(reason.contains("content"));
    }
}
