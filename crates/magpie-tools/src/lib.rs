use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use magpie_extract::{ContentExtractor, SearchBackend};
use magpie_providers::{Provider, ToolDeclaration};
use magpie_store::Store;
use magpie_types::{ResearchEvent, ResearchParameters};

mod citation;
mod database;
mod formatter;
mod llm_tools;
mod search;

pub use citation::CitationTool;
pub use database::DatabaseTool;
pub use formatter::ReportFormatterTool;
pub use llm_tools::{AnalysisTool, FactCheckTool, RelevanceScoringTool, SummarizationTool};
pub use search::SearchTool;

/// Destination for events a tool wants to surface (only `database_tool`
/// emits today). Implemented by the engine's event bus; tests capture.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ResearchEvent);
}

/// Sink that drops everything; handy for tests and one-shot invocations.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ResearchEvent) {}
}

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum FieldKind {
    Text {
        min_len: usize,
        max_len: usize,
    },
    Integer {
        min: i64,
        max: i64,
    },
    Number {
        min: f64,
        max: f64,
    },
    Flag,
    TextList,
    Choice(Vec<&'static str>),
    Json,
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

/// A tool's declared interface: the schema is data, not behavior, so it can
/// be validated, listed and shipped to the LLM without touching the tool.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: &'static str,
    pub description: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl ToolSchema {
    /// JSON-schema rendering for the chat-completions tool declaration.
    pub fn input_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let spec = match &field.kind {
                FieldKind::Text { min_len, max_len } => json!({
                    "type": "string",
                    "minLength": min_len,
                    "maxLength": max_len,
                    "description": field.description,
                }),
                FieldKind::Integer { min, max } => json!({
                    "type": "integer",
                    "minimum": min,
                    "maximum": max,
                    "description": field.description,
                }),
                FieldKind::Number { min, max } => json!({
                    "type": "number",
                    "minimum": min,
                    "maximum": max,
                    "description": field.description,
                }),
                FieldKind::Flag => json!({
                    "type": "boolean",
                    "description": field.description,
                }),
                FieldKind::TextList => json!({
                    "type": "array",
                    "items": {"type": "string"},
                    "description": field.description,
                }),
                FieldKind::Choice(options) => json!({
                    "type": "string",
                    "enum": options,
                    "description": field.description,
                }),
                FieldKind::Json => json!({
                    "type": "object",
                    "description": field.description,
                }),
            };
            properties.insert(field.name.to_string(), spec);
            if field.required {
                required.push(Value::String(field.name.to_string()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    pub fn to_declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name.to_string(),
            description: self.description.to_string(),
            input_schema: self.input_schema(),
        }
    }

    pub fn validate(&self, args: &Value) -> Result<(), ArgError> {
        let Some(object) = args.as_object() else {
            return Err(ArgError::new("$", "arguments must be a JSON object"));
        };
        for field in &self.fields {
            let value = object.get(field.name);
            let Some(value) = value else {
                if field.required {
                    return Err(ArgError::new(field.name, "missing required field"));
                }
                continue;
            };
            if value.is_null() {
                if field.required {
                    return Err(ArgError::new(field.name, "missing required field"));
                }
                continue;
            }
            match &field.kind {
                FieldKind::Text { min_len, max_len } => {
                    let Some(text) = value.as_str() else {
                        return Err(ArgError::new(field.name, "expected a string"));
                    };
                    let len = text.chars().count();
                    if len < *min_len || len > *max_len {
                        return Err(ArgError::new(
                            field.name,
                            format!("length must be between {min_len} and {max_len}"),
                        ));
                    }
                }
                FieldKind::Integer { min, max } => {
                    let Some(number) = value.as_i64() else {
                        return Err(ArgError::new(field.name, "expected an integer"));
                    };
                    if number < *min || number > *max {
                        return Err(ArgError::new(
                            field.name,
                            format!("must be between {min} and {max}"),
                        ));
                    }
                }
                FieldKind::Number { min, max } => {
                    let Some(number) = value.as_f64() else {
                        return Err(ArgError::new(field.name, "expected a number"));
                    };
                    if number < *min || number > *max {
                        return Err(ArgError::new(
                            field.name,
                            format!("must be between {min} and {max}"),
                        ));
                    }
                }
                FieldKind::Flag => {
                    if !value.is_boolean() {
                        return Err(ArgError::new(field.name, "expected a boolean"));
                    }
                }
                FieldKind::TextList => {
                    let Some(items) = value.as_array() else {
                        return Err(ArgError::new(field.name, "expected an array of strings"));
                    };
                    if items.iter().any(|item| !item.is_string()) {
                        return Err(ArgError::new(field.name, "expected an array of strings"));
                    }
                }
                FieldKind::Choice(options) => {
                    let Some(text) = value.as_str() else {
                        return Err(ArgError::new(field.name, "expected a string"));
                    };
                    if !options.contains(&text) {
                        return Err(ArgError::new(
                            field.name,
                            format!("must be one of: {}", options.join(", ")),
                        ));
                    }
                }
                FieldKind::Json => {
                    if !value.is_object() && !value.is_array() {
                        return Err(ArgError::new(field.name, "expected a JSON object"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgError {
    pub field: String,
    pub reason: String,
}

impl ArgError {
    fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for ArgError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid argument `{}`: {}", self.field, self.reason)
    }
}

impl std::error::Error for ArgError {}

// ---------------------------------------------------------------------------
// Tool trait and registry
// ---------------------------------------------------------------------------

/// What a tool invocation produced. Failures are data handed back to the
/// agent as an observation, never an exception across the agent boundary.
#[derive(Debug, Clone)]
pub enum ToolReply {
    Success(Value),
    Failure(String),
}

impl ToolReply {
    pub fn success(value: Value) -> anyhow::Result<ToolReply> {
        Ok(ToolReply::Success(value))
    }

    pub fn failure(reason: impl Into<String>) -> anyhow::Result<ToolReply> {
        Ok(ToolReply::Failure(reason.into()))
    }

    /// Observation value appended to the agent history.
    pub fn observation(&self) -> Value {
        match self {
            ToolReply::Success(value) => value.clone(),
            ToolReply::Failure(reason) => json!({"error": reason}),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply>;
}

#[derive(Debug)]
pub enum ToolExecution {
    Reply(ToolReply),
    /// Arguments failed schema validation; the agent gets one corrective
    /// feedback round before being aborted.
    SchemaViolation(ArgError),
    UnknownTool(String),
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.schema().name.to_string(), tool);
    }

    pub fn schemas(&self, allowlist: Option<&[&str]>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|tool| tool.schema())
            .filter(|schema| {
                allowlist
                    .map(|names| names.contains(&schema.name))
                    .unwrap_or(true)
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(b.name));
        schemas
    }

    pub fn declarations(&self, allowlist: Option<&[&str]>) -> Vec<ToolDeclaration> {
        self.schemas(allowlist)
            .iter()
            .map(ToolSchema::to_declaration)
            .collect()
    }

    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolExecution> {
        let Some(tool) = self.tools.get(name) else {
            return Ok(ToolExecution::UnknownTool(name.to_string()));
        };
        if let Err(err) = tool.schema().validate(&args) {
            return Ok(ToolExecution::SchemaViolation(err));
        }
        let reply = tool.invoke(args).await?;
        Ok(ToolExecution::Reply(reply))
    }
}

// ---------------------------------------------------------------------------
// Per-session toolset
// ---------------------------------------------------------------------------

/// Shared collaborators handed to tools; one bundle per process, the
/// session binding happens in [`research_toolset`].
#[derive(Clone)]
pub struct ToolServices {
    pub store: Arc<Store>,
    pub search: Arc<dyn SearchBackend>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub provider: Arc<dyn Provider>,
    pub events: Arc<dyn EventSink>,
}

/// Build the full research toolset bound to one session. Stage allowlists
/// are applied later by the agent runtime.
pub fn research_toolset(
    services: &ToolServices,
    session_id: &str,
    parameters: &ResearchParameters,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(SearchTool::new(
        services.search.clone(),
        services.extractor.clone(),
        services.store.clone(),
        session_id.to_string(),
        parameters.clone(),
    )));
    registry.register(Arc::new(DatabaseTool::new(
        services.store.clone(),
        services.events.clone(),
        session_id.to_string(),
    )));
    registry.register(Arc::new(AnalysisTool::new(services.provider.clone())));
    registry.register(Arc::new(SummarizationTool::new(services.provider.clone())));
    registry.register(Arc::new(FactCheckTool::new(services.provider.clone())));
    registry.register(Arc::new(RelevanceScoringTool::new(
        services.provider.clone(),
    )));
    registry.register(Arc::new(CitationTool));
    registry.register(Arc::new(ReportFormatterTool));
    registry
}
