use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::{FieldKind, FieldSpec, Tool, ToolReply, ToolSchema};

/// Pure string manipulation over citations; no I/O, safe to retry freely.
pub struct CitationTool;

#[derive(Debug, Default)]
struct SourceFields {
    author: String,
    title: String,
    url: String,
    date: String,
    publisher: String,
}

fn source_fields(value: &Value) -> SourceFields {
    let text = |key: &str| {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string()
    };
    SourceFields {
        author: text("author"),
        title: text("title"),
        url: text("url"),
        date: text("date"),
        publisher: text("publisher"),
    }
}

fn format_citation(source: &SourceFields, style: &str) -> String {
    let author = if source.author.is_empty() {
        "Unknown author".to_string()
    } else {
        source.author.clone()
    };
    let title = if source.title.is_empty() {
        "Untitled".to_string()
    } else {
        source.title.clone()
    };
    let date = if source.date.is_empty() {
        "n.d.".to_string()
    } else {
        source.date.clone()
    };
    match style {
        "apa" => {
            let mut out = format!("{author} ({date}). {title}.");
            if !source.publisher.is_empty() {
                out.push_str(&format!(" {}.", source.publisher));
            }
            if !source.url.is_empty() {
                out.push_str(&format!(" {}", source.url));
            }
            out
        }
        "mla" => {
            let mut out = format!("{author}. \"{title}.\"");
            if !source.publisher.is_empty() {
                out.push_str(&format!(" {},", source.publisher));
            }
            out.push_str(&format!(" {date}"));
            if !source.url.is_empty() {
                out.push_str(&format!(", {}", source.url));
            }
            out.push('.');
            out
        }
        "chicago" => {
            let mut out = format!("{author}. \"{title}.\"");
            if !source.publisher.is_empty() {
                out.push_str(&format!(" {}.", source.publisher));
            }
            out.push_str(&format!(" {date}."));
            if !source.url.is_empty() {
                out.push_str(&format!(" {}.", source.url));
            }
            out
        }
        "harvard" => {
            let mut out = format!("{author} {date}, {title}");
            if !source.publisher.is_empty() {
                out.push_str(&format!(", {}", source.publisher));
            }
            if !source.url.is_empty() {
                out.push_str(&format!(", viewed at {}", source.url));
            }
            out.push('.');
            out
        }
        // markdown and anything unrecognized
        _ => {
            if source.url.is_empty() {
                format!("**{title}** — {author}, {date}")
            } else {
                format!("[{title}]({}) — {author}, {date}", source.url)
            }
        }
    }
}

/// Inline `[text](http…)` links found in a body of markdown, in order.
pub fn extract_inline_citations(text: &str) -> Vec<(String, String)> {
    let link = Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)").expect("link regex");
    link.captures_iter(text)
        .map(|cap| (cap[1].to_string(), cap[2].to_string()))
        .collect()
}

fn validate_source(source: &SourceFields) -> Vec<String> {
    let mut problems = Vec::new();
    if source.title.is_empty() {
        problems.push("missing title".to_string());
    }
    if source.url.is_empty() {
        problems.push("missing url".to_string());
    } else if !source.url.starts_with("http://") && !source.url.starts_with("https://") {
        problems.push("url is not http(s)".to_string());
    }
    if source.date.is_empty() {
        problems.push("missing date".to_string());
    }
    problems
}

#[async_trait]
impl Tool for CitationTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "citation_tool",
            description: "Create, format, extract or validate citations. `format` \
                          renders a source in a citation style; `extract` pulls \
                          inline markdown links out of text; `validate` reports \
                          missing fields.",
            fields: vec![
                FieldSpec::required(
                    "action",
                    FieldKind::Choice(vec!["create", "format", "extract", "validate"]),
                    "what to do",
                ),
                FieldSpec::optional(
                    "source",
                    FieldKind::Json,
                    "source fields: author, title, url, date, publisher",
                ),
                FieldSpec::optional(
                    "format",
                    FieldKind::Choice(vec!["apa", "mla", "chicago", "harvard", "markdown"]),
                    "citation style (default markdown)",
                ),
                FieldSpec::optional(
                    "text",
                    FieldKind::Text {
                        min_len: 1,
                        max_len: 200_000,
                    },
                    "text to extract citations from",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let style = args["format"].as_str().unwrap_or("markdown");
        match args["action"].as_str().unwrap_or_default() {
            "create" | "format" => {
                let Some(source_value) = args.get("source").filter(|v| v.is_object()) else {
                    return ToolReply::failure("format requires a source object");
                };
                let source = source_fields(source_value);
                ToolReply::success(json!({
                    "citation": format_citation(&source, style),
                    "style": style,
                }))
            }
            "extract" => {
                let Some(text) = args["text"].as_str() else {
                    return ToolReply::failure("extract requires text");
                };
                let citations: Vec<Value> = extract_inline_citations(text)
                    .into_iter()
                    .enumerate()
                    .map(|(position, (quote, url))| {
                        json!({"position": position, "quote": quote, "url": url})
                    })
                    .collect();
                ToolReply::success(json!({"count": citations.len(), "citations": citations}))
            }
            "validate" => {
                let Some(source_value) = args.get("source").filter(|v| v.is_object()) else {
                    return ToolReply::failure("validate requires a source object");
                };
                let problems = validate_source(&source_fields(source_value));
                ToolReply::success(json!({
                    "valid": problems.is_empty(),
                    "problems": problems,
                }))
            }
            other => ToolReply::failure(format!("unsupported action `{other}`")),
        }
    }
}
