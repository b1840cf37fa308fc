use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use magpie_extract::{ContentExtractor, SearchBackend, SearchQuery, DEFAULT_EXTRACT_CONCURRENCY};
use magpie_store::Store;
use magpie_types::ResearchParameters;

use crate::{FieldKind, FieldSpec, Tool, ToolReply, ToolSchema};

/// Web search with optional inline extraction. Bound to a session so the
/// issued queries land in its query log and domain filters follow the
/// session parameters.
pub struct SearchTool {
    search: Arc<dyn SearchBackend>,
    extractor: Arc<dyn ContentExtractor>,
    store: Arc<Store>,
    session_id: String,
    parameters: ResearchParameters,
}

impl SearchTool {
    pub fn new(
        search: Arc<dyn SearchBackend>,
        extractor: Arc<dyn ContentExtractor>,
        store: Arc<Store>,
        session_id: String,
        parameters: ResearchParameters,
    ) -> Self {
        Self {
            search,
            extractor,
            store,
            session_id,
            parameters,
        }
    }
}

#[async_trait]
impl Tool for SearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "search_tool",
            description: "Search the web for a query and optionally fetch the readable \
                          content of each result. Use focused queries; repeat with \
                          different phrasings to broaden coverage.",
            fields: vec![
                FieldSpec::required(
                    "query",
                    FieldKind::Text {
                        min_len: 2,
                        max_len: 400,
                    },
                    "search query",
                ),
                FieldSpec::optional(
                    "max_results",
                    FieldKind::Integer { min: 1, max: 50 },
                    "maximum number of results (default 10)",
                ),
                FieldSpec::optional(
                    "extract_content",
                    FieldKind::Flag,
                    "fetch and extract each result page (default true)",
                ),
                FieldSpec::optional(
                    "language",
                    FieldKind::Text {
                        min_len: 2,
                        max_len: 16,
                    },
                    "BCP-47 language override",
                ),
                FieldSpec::optional(
                    "time_range",
                    FieldKind::Text {
                        min_len: 2,
                        max_len: 8,
                    },
                    "recency window such as 7d, 1m or 1y",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let query_text = args["query"].as_str().unwrap_or_default().trim().to_string();
        let max_results = args["max_results"].as_i64().unwrap_or(10).clamp(1, 50) as usize;
        let extract_content = args["extract_content"].as_bool().unwrap_or(true);

        let query = SearchQuery {
            query: query_text.clone(),
            max_results,
            language: args["language"]
                .as_str()
                .map(str::to_string)
                .or_else(|| Some(self.parameters.language.clone())),
            time_range: args["time_range"]
                .as_str()
                .map(str::to_string)
                .or_else(|| self.parameters.date_range.clone()),
            allowed_domains: self.parameters.allowed_domains.clone(),
            blocked_domains: self.parameters.blocked_domains.clone(),
        };

        let hits = match self.search.search(&query).await {
            Ok(hits) => hits,
            Err(err) => return ToolReply::failure(format!("search failed: {err}")),
        };

        if let Err(err) = self
            .store
            .record_research_query(&self.session_id, &query_text, hits.len() as u64)
            .await
        {
            tracing::warn!(session_id = %self.session_id, "query log write failed: {err}");
        }

        let mut items: Vec<Value> = hits
            .iter()
            .map(|hit| {
                json!({
                    "url": hit.url,
                    "title": hit.title,
                    "snippet": hit.snippet,
                    "engine": hit.engine,
                    "score": hit.score,
                })
            })
            .collect();

        if extract_content && !hits.is_empty() {
            let urls: Vec<String> = hits.iter().map(|hit| hit.url.clone()).collect();
            let pages = self
                .extractor
                .extract_many(urls, DEFAULT_EXTRACT_CONCURRENCY)
                .await;
            for (item, page) in items.iter_mut().zip(pages) {
                if let Some(error) = page.error {
                    item["error"] = json!(error);
                } else {
                    item["content"] = json!(page.content);
                    item["text_length"] = json!(page.text_length);
                    if item["title"].as_str().map(str::is_empty).unwrap_or(true) {
                        item["title"] = json!(page.title);
                    }
                    if let Some(date) = page.published_date {
                        item["published_date"] = json!(date);
                    }
                }
            }
        }

        ToolReply::success(json!({
            "query": query_text,
            "count": items.len(),
            "results": items,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToolExecution, ToolRegistry};
    use magpie_extract::{ExtractedPage, SearchHit};
    use magpie_types::ResearchSession;

    struct StubSearch {
        hits: Vec<SearchHit>,
    }

    #[async_trait]
    impl SearchBackend for StubSearch {
        async fn search(&self, _query: &SearchQuery) -> anyhow::Result<Vec<SearchHit>> {
            Ok(self.hits.clone())
        }
    }

    struct StubExtractor;

    #[async_trait]
    impl ContentExtractor for StubExtractor {
        async fn extract(&self, url: &str) -> ExtractedPage {
            if url.contains("broken") {
                ExtractedPage::failure(url, "connection refused")
            } else {
                ExtractedPage {
                    url: url.to_string(),
                    title: "stub page".to_string(),
                    content: "stub content body".to_string(),
                    text_length: 17,
                    published_date: None,
                    error: None,
                }
            }
        }
    }

    async fn toolset(hits: Vec<SearchHit>) -> (ToolRegistry, Arc<Store>, String) {
        let store = Arc::new(Store::in_memory().await.expect("store"));
        let session =
            ResearchSession::new("user-1", "a plausible topic", ResearchParameters::default());
        store.create_session(&session).await.expect("session");
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SearchTool::new(
            Arc::new(StubSearch { hits }),
            Arc::new(StubExtractor),
            store.clone(),
            session.id.clone(),
            ResearchParameters::default(),
        )));
        (registry, store, session.id)
    }

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: String::new(),
            snippet: "snippet".to_string(),
            engine: "stub".to_string(),
            score: 1.0,
        }
    }

    #[tokio::test]
    async fn search_returns_results_with_extracted_content() {
        let (registry, _store, _session) =
            toolset(vec![hit("https://ok.example/a"), hit("https://broken.example/b")]).await;
        let outcome = registry
            .execute("search_tool", json!({"query": "anything"}))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected outcome: {outcome:?}");
        };
        assert_eq!(value["count"], 2);
        assert_eq!(value["results"][0]["content"], "stub content body");
        assert_eq!(value["results"][0]["title"], "stub page");
        assert_eq!(value["results"][1]["error"], "connection refused");
        assert!(value["results"][1].get("content").is_none());
    }

    #[tokio::test]
    async fn queries_are_logged_for_the_session() {
        let (registry, store, session_id) = toolset(vec![hit("https://ok.example/a")]).await;
        registry
            .execute("search_tool", json!({"query": "solid state batteries"}))
            .await
            .expect("execute");
        let queries = store
            .list_research_queries(&session_id)
            .await
            .expect("queries");
        assert_eq!(queries, vec![("solid state batteries".to_string(), 1)]);
    }

    #[tokio::test]
    async fn invalid_max_results_is_a_schema_violation() {
        let (registry, _store, _session) = toolset(Vec::new()).await;
        let outcome = registry
            .execute("search_tool", json!({"query": "x y", "max_results": 500}))
            .await
            .expect("execute");
        assert!(matches!(outcome, ToolExecution::SchemaViolation(_)));
    }
}
