use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use magpie_providers::{ChatMessage, ChatRequest};
use magpie_queue::JobContext;
use magpie_store::{StatusUpdate, Store, StoreError};
use magpie_tools::research_toolset;
use magpie_types::{
    JobRecord, ReportDraft, ResearchDataDraft, ResearchDataType, ResearchEvent,
    ResearchEventKind, ResearchParameters, SessionStatus, SourceDraft,
};

use crate::agent::{AgentOutcome, AgentRunner, AgentSpec, StopCondition, DEFAULT_MAX_ITERATIONS};
use crate::prompts;
use crate::report;
use crate::services::Services;

const PHASE_RESEARCH: &str = "research";
const PHASE_ANALYZE: &str = "analyze";
const PHASE_WRITE: &str = "write";
const PHASE_COMPLETE: &str = "complete";

/// Drives one session through the three-stage pipeline. Stages hand off
/// through the scratchpad rows only, so a stage always sees everything its
/// predecessors produced regardless of context-window limits.
pub struct WorkflowDriver {
    services: Services,
}

struct MinSourcesReached {
    store: Arc<Store>,
    session_id: String,
    min_sources: u64,
}

#[async_trait]
impl StopCondition for MinSourcesReached {
    async fn should_stop(&self) -> bool {
        let extracted = self
            .store
            .count_research_data(&self.session_id, ResearchDataType::ExtractedContent)
            .await
            .unwrap_or(0);
        let source_content = self
            .store
            .count_research_data(&self.session_id, ResearchDataType::SourceContent)
            .await
            .unwrap_or(0);
        extracted + source_content >= self.min_sources
    }
}

impl WorkflowDriver {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    /// Entry point used by the worker pool. Failures are rethrown for the
    /// queue's retry bookkeeping; the session is marked FAILED only once
    /// the final attempt is spent, because FAILED is terminal and a retry
    /// could not legally leave it.
    pub async fn run(&self, job: &JobRecord, ctx: &JobContext) -> anyhow::Result<()> {
        let session_id = job.id.clone();
        let result = self.execute(job, ctx).await;
        self.services.cancellations.remove(&session_id).await;
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                tracing::error!(session_id = %session_id, "workflow failed: {message}");
                let out_of_attempts = job.attempts >= job.max_attempts;
                if out_of_attempts {
                    match self
                        .services
                        .store
                        .update_status(
                            &session_id,
                            SessionStatus::Failed,
                            StatusUpdate {
                                error_message: Some(message.clone()),
                                report_id: None,
                            },
                        )
                        .await
                    {
                        Ok(_) => {
                            self.emit_status(&session_id, SessionStatus::Failed);
                        }
                        Err(StoreError::IllegalTransition { from, .. })
                            if from == SessionStatus::Cancelled =>
                        {
                            // cancelled while failing; cancellation wins
                            return Ok(());
                        }
                        Err(store_err) => {
                            tracing::warn!(
                                session_id = %session_id,
                                "failure bookkeeping error: {store_err}"
                            );
                        }
                    }
                }
                self.services.bus.publish(ResearchEvent::new(
                    ResearchEventKind::Error,
                    &session_id,
                    json!({"message": message, "will_retry": !out_of_attempts}),
                ));
                Err(err)
            }
        }
    }

    async fn execute(&self, job: &JobRecord, ctx: &JobContext) -> anyhow::Result<()> {
        let session_id = job.id.as_str();
        let Some(session) = self.services.store.get_session(session_id).await? else {
            anyhow::bail!("session {session_id} does not exist");
        };
        match session.status {
            SessionStatus::Completed | SessionStatus::Cancelled => return Ok(()),
            SessionStatus::Failed => {
                anyhow::bail!("session {session_id} is already marked failed")
            }
            SessionStatus::Pending | SessionStatus::Processing => {}
        }

        // Idempotent completion: a crash between persisting the report and
        // flipping the status leaves a report row behind; adopt it.
        if let Some(report) = self.services.store.get_report_by_session(session_id).await? {
            tracing::info!(session_id, "report already persisted, completing session");
            self.finish_completed(session_id, &report.id, report.word_count, ctx)
                .await?;
            return Ok(());
        }

        let parameters = session.parameters.clone();
        let topic = session.topic.clone();

        let cancel = self.services.cancellations.create(session_id).await;
        if ctx.cancel.is_cancelled() {
            cancel.cancel();
        }
        let bridge = {
            let upstream = ctx.cancel.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = upstream.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            })
        };
        let result = self
            .run_stages(session_id, &topic, &parameters, &cancel, ctx)
            .await;
        bridge.abort();
        result
    }

    async fn run_stages(
        &self,
        session_id: &str,
        topic: &str,
        parameters: &ResearchParameters,
        cancel: &CancellationToken,
        ctx: &JobContext,
    ) -> anyhow::Result<()> {
        self.services
            .store
            .update_status(session_id, SessionStatus::Processing, StatusUpdate::default())
            .await?;
        self.emit_status(session_id, SessionStatus::Processing);
        self.emit_progress(session_id, 0, PHASE_RESEARCH, ctx).await;

        let registry = research_toolset(&self.services.tool_services(), session_id, parameters);
        let runner = AgentRunner::new(self.services.provider.as_ref(), &registry);

        // Stage A: research
        let stop = MinSourcesReached {
            store: self.services.store.clone(),
            session_id: session_id.to_string(),
            min_sources: u64::from(parameters.min_sources.max(1)),
        };
        let outcome = runner
            .run(
                &research_spec(),
                prompts::research_task_prompt(topic, parameters),
                cancel,
                Some(&stop),
            )
            .await?;
        if self.handle_stage_exit("research", session_id, &outcome).await? {
            return Ok(());
        }
        self.emit_progress(session_id, 33, PHASE_ANALYZE, ctx).await;

        // Stage B: analyze
        let outcome = runner
            .run(
                &analyze_spec(),
                prompts::analyze_task_prompt(topic),
                cancel,
                None,
            )
            .await?;
        if self.handle_stage_exit("analyze", session_id, &outcome).await? {
            return Ok(());
        }
        if let AgentOutcome::FinalAnswer(text) = &outcome {
            self.ensure_analysis_artifact(session_id, text).await?;
        }
        self.emit_progress(session_id, 66, PHASE_WRITE, ctx).await;

        // Stage C: write
        let outcome = runner
            .run(
                &write_spec(),
                prompts::write_task_prompt(topic, parameters),
                cancel,
                None,
            )
            .await?;
        let draft_markdown = match &outcome {
            AgentOutcome::Cancelled => {
                self.finish_cancelled(session_id).await?;
                return Ok(());
            }
            AgentOutcome::FinalAnswer(markdown) => markdown.clone(),
            AgentOutcome::Exhausted => String::new(),
            AgentOutcome::Stopped => String::new(),
            AgentOutcome::Aborted(reason) => {
                anyhow::bail!("write stage aborted: {reason}")
            }
        };

        let markdown = self
            .validated_report(session_id, topic, parameters, draft_markdown, cancel)
            .await?;

        self.services.bus.publish(ResearchEvent::new(
            ResearchEventKind::PartialReport,
            session_id,
            json!({"content": markdown}),
        ));

        let draft = self.assemble_draft(session_id, parameters, &markdown).await?;
        let report = self.services.store.save_report(session_id, &draft).await?;
        self.finish_completed(session_id, &report.id, report.word_count, ctx)
            .await?;
        Ok(())
    }

    /// Returns Ok(true) when the stage ended the session (cancellation);
    /// errors on exhaustion or abort, which only Stage C may repair.
    async fn handle_stage_exit(
        &self,
        stage: &str,
        session_id: &str,
        outcome: &AgentOutcome,
    ) -> anyhow::Result<bool> {
        match outcome {
            AgentOutcome::FinalAnswer(_) | AgentOutcome::Stopped => Ok(false),
            AgentOutcome::Cancelled => {
                self.finish_cancelled(session_id).await?;
                Ok(true)
            }
            AgentOutcome::Exhausted => {
                anyhow::bail!("{stage} stage exhausted its iteration budget")
            }
            AgentOutcome::Aborted(reason) => {
                anyhow::bail!("{stage} stage aborted: {reason}")
            }
        }
    }

    async fn ensure_analysis_artifact(
        &self,
        session_id: &str,
        final_answer: &str,
    ) -> anyhow::Result<()> {
        let existing = self
            .services
            .store
            .count_research_data(session_id, ResearchDataType::Analysis)
            .await?;
        if existing == 0 && !final_answer.trim().is_empty() {
            self.services
                .store
                .append_research_data(
                    session_id,
                    ResearchDataType::Analysis,
                    &ResearchDataDraft {
                        title: Some("stage analysis".to_string()),
                        content: final_answer.to_string(),
                        ..Default::default()
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Skeleton validation with a single constrained repair pass.
    async fn validated_report(
        &self,
        session_id: &str,
        topic: &str,
        parameters: &ResearchParameters,
        draft: String,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        match report::validate_skeleton(&draft) {
            Ok(()) => return Ok(draft),
            Err(problems) => {
                if cancel.is_cancelled() {
                    self.finish_cancelled(session_id).await?;
                    anyhow::bail!("cancelled during report repair");
                }
                tracing::warn!(session_id, "report skeleton invalid ({problems}), repairing");
                let repair = self
                    .services
                    .provider
                    .complete(ChatRequest {
                        messages: vec![
                            ChatMessage::system(prompts::write_system_prompt()),
                            ChatMessage::user(prompts::write_task_prompt(topic, parameters)),
                            ChatMessage::user(prompts::repair_task_prompt(
                                &draft,
                                &problems.to_string(),
                            )),
                        ],
                        temperature: Some(0.2),
                        ..Default::default()
                    })
                    .await?;
                let repaired = repair.text.trim().to_string();
                report::validate_skeleton(&repaired)
                    .map_err(|err| anyhow::anyhow!("report failed validation after repair: {err}"))?;
                Ok(repaired)
            }
        }
    }

    async fn assemble_draft(
        &self,
        session_id: &str,
        parameters: &ResearchParameters,
        markdown: &str,
    ) -> anyhow::Result<ReportDraft> {
        let mut rows = self
            .services
            .store
            .get_research_data(
                session_id,
                Some(ResearchDataType::ExtractedContent),
                Some(parameters.max_sources),
            )
            .await?;
        rows.extend(
            self.services
                .store
                .get_research_data(
                    session_id,
                    Some(ResearchDataType::SourceContent),
                    Some(parameters.max_sources),
                )
                .await?,
        );

        let mut sources: Vec<SourceDraft> = Vec::new();
        for row in rows {
            let Some(url) = row
                .metadata
                .as_ref()
                .and_then(|meta| meta.get("url"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
            else {
                continue;
            };
            if sources.iter().any(|existing| existing.url == url) {
                continue;
            }
            let summary = row
                .metadata
                .as_ref()
                .and_then(|meta| meta.get("summary"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| truncate_chars(&row.content, 280));
            sources.push(SourceDraft {
                url,
                title: row.title.clone().unwrap_or_default(),
                content: row.content.clone(),
                summary,
                relevance_score: row.relevance_score,
                metadata: row.metadata.clone(),
            });
            if sources.len() >= parameters.max_sources as usize {
                break;
            }
        }

        Ok(ReportDraft {
            content: markdown.to_string(),
            summary: report::extract_summary(markdown),
            key_findings: report::extract_key_findings(markdown),
            sources,
            citations: report::extract_citations(markdown),
        })
    }

    async fn finish_completed(
        &self,
        session_id: &str,
        report_id: &str,
        word_count: u64,
        ctx: &JobContext,
    ) -> anyhow::Result<()> {
        match self
            .services
            .store
            .update_status(
                session_id,
                SessionStatus::Completed,
                StatusUpdate {
                    error_message: None,
                    report_id: Some(report_id.to_string()),
                },
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::IllegalTransition { from, .. })
                if from == SessionStatus::Cancelled =>
            {
                // a cancel landed between the report write and the status
                // flip; the cancellation stands
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }
        self.emit_progress(session_id, 100, PHASE_COMPLETE, ctx).await;
        self.emit_status(session_id, SessionStatus::Completed);
        self.services.bus.publish(ResearchEvent::new(
            ResearchEventKind::ResearchComplete,
            session_id,
            json!({"report_id": report_id, "word_count": word_count}),
        ));
        Ok(())
    }

    async fn finish_cancelled(&self, session_id: &str) -> anyhow::Result<()> {
        match self
            .services
            .store
            .update_status(session_id, SessionStatus::Cancelled, StatusUpdate::default())
            .await
        {
            Ok(_) => {}
            Err(StoreError::IllegalTransition { .. }) => {}
            Err(err) => return Err(err.into()),
        }
        self.emit_status(session_id, SessionStatus::Cancelled);
        tracing::info!(session_id, "session cancelled cooperatively");
        Ok(())
    }

    async fn emit_progress(&self, session_id: &str, percent: u8, phase: &str, ctx: &JobContext) {
        ctx.report_progress(percent, phase).await;
        self.services
            .bus
            .publish(ResearchEvent::progress(session_id, percent, phase));
    }

    fn emit_status(&self, session_id: &str, status: SessionStatus) {
        self.services
            .bus
            .publish(ResearchEvent::status_change(session_id, status.as_str()));
    }
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        input.chars().take(max_chars).collect::<String>() + "…"
    }
}

fn research_spec() -> AgentSpec {
    AgentSpec {
        name: "research",
        system_prompt: prompts::research_system_prompt(),
        tools: vec![
            "search_tool",
            "database_tool",
            "analysis_tool",
            "summarization_tool",
            "citation_tool",
        ],
        temperature: 0.7,
        max_iterations: DEFAULT_MAX_ITERATIONS,
    }
}

fn analyze_spec() -> AgentSpec {
    AgentSpec {
        name: "analyze",
        system_prompt: prompts::analyze_system_prompt(),
        tools: vec![
            "database_tool",
            "analysis_tool",
            "fact_check_tool",
            "relevance_scoring_tool",
        ],
        temperature: 0.3,
        max_iterations: DEFAULT_MAX_ITERATIONS,
    }
}

fn write_spec() -> AgentSpec {
    AgentSpec {
        name: "write",
        system_prompt: prompts::write_system_prompt(),
        tools: vec![
            "report_formatter_tool",
            "citation_tool",
            "summarization_tool",
            "database_tool",
        ],
        temperature: 0.5,
        max_iterations: DEFAULT_MAX_ITERATIONS,
    }
}
