use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use magpie_providers::{ChatMessage, ChatRequest, Provider};

use crate::{FieldKind, FieldSpec, Tool, ToolReply, ToolSchema};

async fn complete_for_tool(
    provider: &dyn Provider,
    system: &str,
    user: String,
    temperature: f64,
) -> anyhow::Result<ToolReply> {
    let request = ChatRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        temperature: Some(temperature),
        ..Default::default()
    };
    match provider.complete(request).await {
        Ok(completion) => ToolReply::success(json!({"text": completion.text})),
        Err(err) => ToolReply::failure(format!("model call failed: {err}")),
    }
}

/// Stateless structured analysis over a blob of content.
pub struct AnalysisTool {
    provider: Arc<dyn Provider>,
}

impl AnalysisTool {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for AnalysisTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "analysis_tool",
            description: "Analyze content for a specific angle. Returns a structured \
                          textual analysis.",
            fields: vec![
                FieldSpec::required(
                    "content",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 200_000,
                    },
                    "content to analyze",
                ),
                FieldSpec::optional(
                    "analysis_type",
                    FieldKind::Choice(vec![
                        "general",
                        "patterns",
                        "contradictions",
                        "confidence",
                        "themes",
                    ]),
                    "analysis angle (default general)",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let analysis_type = args["analysis_type"].as_str().unwrap_or("general");
        let content = args["content"].as_str().unwrap_or_default();
        let system = "You are a research analyst. Produce a concise, well-structured \
                      analysis of the provided material. Note concrete evidence and \
                      avoid speculation.";
        let user = format!(
            "Analysis angle: {analysis_type}\n\nMaterial:\n{content}\n\nRespond with \
             findings organized under short headings."
        );
        let reply = complete_for_tool(self.provider.as_ref(), system, user, 0.3).await?;
        Ok(match reply {
            ToolReply::Success(value) => ToolReply::Success(json!({
                "analysis_type": analysis_type,
                "analysis": value["text"],
            })),
            failure => failure,
        })
    }
}

/// Stateless summarization call.
pub struct SummarizationTool {
    provider: Arc<dyn Provider>,
}

impl SummarizationTool {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for SummarizationTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "summarization_tool",
            description: "Summarize content at a chosen granularity.",
            fields: vec![
                FieldSpec::required(
                    "content",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 200_000,
                    },
                    "content to summarize",
                ),
                FieldSpec::optional(
                    "summary_type",
                    FieldKind::Choice(vec!["brief", "detailed", "bullet_points"]),
                    "summary style (default brief)",
                ),
                FieldSpec::optional(
                    "max_length",
                    FieldKind::Integer { min: 50, max: 5000 },
                    "approximate word budget",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let summary_type = args["summary_type"].as_str().unwrap_or("brief");
        let max_length = args["max_length"].as_i64().unwrap_or(200);
        let content = args["content"].as_str().unwrap_or_default();
        let system = "You summarize research material faithfully; no new claims.";
        let user = format!(
            "Produce a {summary_type} summary of at most roughly {max_length} words:\n\n{content}"
        );
        let reply = complete_for_tool(self.provider.as_ref(), system, user, 0.2).await?;
        Ok(match reply {
            ToolReply::Success(value) => ToolReply::Success(json!({
                "summary_type": summary_type,
                "summary": value["text"],
            })),
            failure => failure,
        })
    }
}

/// Stateless fact-check pass over claims.
pub struct FactCheckTool {
    provider: Arc<dyn Provider>,
}

impl FactCheckTool {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Tool for FactCheckTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "fact_check_tool",
            description: "Check claims against the provided evidence and flag \
                          unsupported or contradicted statements.",
            fields: vec![
                FieldSpec::required(
                    "claims",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 50_000,
                    },
                    "claims to check, one per line",
                ),
                FieldSpec::optional(
                    "evidence",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 200_000,
                    },
                    "evidence to check against",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let claims = args["claims"].as_str().unwrap_or_default();
        let evidence = args["evidence"].as_str().unwrap_or_default();
        let system = "You are a meticulous fact checker. For each claim answer \
                      supported / contradicted / unverifiable with a one-line reason.";
        let user = format!("Claims:\n{claims}\n\nEvidence:\n{evidence}");
        let reply = complete_for_tool(self.provider.as_ref(), system, user, 0.1).await?;
        Ok(match reply {
            ToolReply::Success(value) => {
                ToolReply::Success(json!({"verdicts": value["text"]}))
            }
            failure => failure,
        })
    }
}

/// Scores content relevance against a topic; the model's reply is reduced
/// to a float in [0,1], defaulting to 0.5 when unparseable.
pub struct RelevanceScoringTool {
    provider: Arc<dyn Provider>,
}

impl RelevanceScoringTool {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self { provider }
    }
}

pub(crate) fn parse_score(text: &str) -> f64 {
    text.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter(|part| !part.is_empty())
        .find_map(|part| part.parse::<f64>().ok())
        // models sometimes answer in percent
        .map(|score| if score > 10.0 { score / 100.0 } else { score })
        .map(|score| score.clamp(0.0, 1.0))
        .unwrap_or(0.5)
}

#[async_trait]
impl Tool for RelevanceScoringTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "relevance_scoring_tool",
            description: "Rate how relevant a piece of content is to the research \
                          topic, from 0.0 to 1.0.",
            fields: vec![
                FieldSpec::required(
                    "content",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 100_000,
                    },
                    "content to rate",
                ),
                FieldSpec::required(
                    "topic",
                    FieldKind::Text {
                        min_len: 3,
                        max_len: 500,
                    },
                    "research topic",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let content = args["content"].as_str().unwrap_or_default();
        let topic = args["topic"].as_str().unwrap_or_default();
        let system =
            "Reply with a single number between 0.0 and 1.0; nothing else.";
        let user = format!("Topic: {topic}\n\nContent:\n{content}\n\nRelevance score:");
        let reply = complete_for_tool(self.provider.as_ref(), system, user, 0.0).await?;
        Ok(match reply {
            ToolReply::Success(value) => {
                let score = parse_score(value["text"].as_str().unwrap_or_default());
                ToolReply::Success(json!({"score": score}))
            }
            failure => failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ToolExecution, ToolRegistry};
    use magpie_providers::ChatCompletion;

    struct CannedProvider {
        reply: String,
    }

    #[async_trait]
    impl Provider for CannedProvider {
        fn label(&self) -> &str {
            "canned"
        }

        async fn complete(&self, _request: ChatRequest) -> anyhow::Result<ChatCompletion> {
            if self.reply == "!error" {
                anyhow::bail!("upstream unavailable");
            }
            Ok(ChatCompletion {
                text: self.reply.clone(),
                ..Default::default()
            })
        }
    }

    fn registry_with(reply: &str) -> ToolRegistry {
        let provider: Arc<dyn Provider> = Arc::new(CannedProvider {
            reply: reply.to_string(),
        });
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(AnalysisTool::new(provider.clone())));
        registry.register(Arc::new(SummarizationTool::new(provider.clone())));
        registry.register(Arc::new(FactCheckTool::new(provider.clone())));
        registry.register(Arc::new(RelevanceScoringTool::new(provider)));
        registry
    }

    #[tokio::test]
    async fn analysis_returns_model_text() {
        let registry = registry_with("patterns: A and B");
        let outcome = registry
            .execute(
                "analysis_tool",
                json!({"content": "material", "analysis_type": "patterns"}),
            )
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert_eq!(value["analysis"], "patterns: A and B");
        assert_eq!(value["analysis_type"], "patterns");
    }

    #[tokio::test]
    async fn provider_errors_become_failure_observations() {
        let registry = registry_with("!error");
        let outcome = registry
            .execute("summarization_tool", json!({"content": "material"}))
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Failure(reason)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert!(reason.contains("upstream unavailable"));
    }

    #[tokio::test]
    async fn relevance_score_is_parsed_and_clamped() {
        let registry = registry_with("I'd say 0.85 overall");
        let outcome = registry
            .execute(
                "relevance_scoring_tool",
                json!({"content": "material", "topic": "a topic"}),
            )
            .await
            .expect("execute");
        let ToolExecution::Reply(ToolReply::Success(value)) = outcome else {
            panic!("unexpected: {outcome:?}");
        };
        assert_eq!(value["score"], 0.85);
    }

    #[test]
    fn score_parsing_handles_noise() {
        assert_eq!(parse_score("0.7"), 0.7);
        assert_eq!(parse_score("Score: 85"), 0.85);
        assert_eq!(parse_score("no number here"), 0.5);
        assert_eq!(parse_score("1.4"), 1.0);
    }
}
