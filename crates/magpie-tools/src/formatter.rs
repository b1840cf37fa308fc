use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{FieldKind, FieldSpec, Tool, ToolReply, ToolSchema};

/// Assembles the mandatory report skeleton from structured input. Keeping
/// the skeleton here rather than in the prompt means a sloppy model still
/// produces well-formed markdown.
pub struct ReportFormatterTool;

fn render_report(content: &Value, style: &str) -> String {
    let title = content
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or("Research Report")
        .trim();
    let summary = content
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .trim();

    let mut out = format!("# {title}\n\n## Executive Summary\n\n{summary}\n\n## Key Findings\n\n");

    let findings = content
        .get("key_findings")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for (index, finding) in findings.iter().enumerate() {
        let line = match finding {
            Value::String(text) => text.clone(),
            Value::Object(map) => {
                let heading = map.get("title").and_then(|v| v.as_str()).unwrap_or("Finding");
                let body = map.get("body").and_then(|v| v.as_str()).unwrap_or_default();
                format!("**{heading}:** {body}")
            }
            other => other.to_string(),
        };
        out.push_str(&format!("{}. {}\n", index + 1, line.trim()));
    }
    out.push('\n');

    let sections = content
        .get("sections")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for section in &sections {
        let heading = section
            .get("heading")
            .and_then(|v| v.as_str())
            .unwrap_or("Discussion");
        let body = section
            .get("body")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        out.push_str(&format!("## {heading}\n\n{body}\n\n", body = body.trim()));
    }
    if sections.is_empty() {
        out.push_str("## Discussion\n\n");
        if let Some(body) = content.get("body").and_then(|v| v.as_str()) {
            out.push_str(body.trim());
            out.push_str("\n\n");
        }
    }

    out.push_str("## References\n\n");
    let references = content
        .get("references")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    for (index, reference) in references.iter().enumerate() {
        let line = match reference {
            Value::String(text) => text.clone(),
            Value::Object(map) => {
                let title = map
                    .get("title")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Untitled");
                match map.get("url").and_then(|v| v.as_str()) {
                    Some(url) => format!("[{title}]({url})"),
                    None => title.to_string(),
                }
            }
            other => other.to_string(),
        };
        out.push_str(&format!("{}. {}\n", index + 1, line.trim()));
    }

    if style == "academic" {
        // Academic drafts carry a closing methodology note.
        out.push_str(
            "\n*Methodology: sources were gathered via web search, extracted, and \
             cross-checked before synthesis.*\n",
        );
    }

    out
}

#[async_trait]
impl Tool for ReportFormatterTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "report_formatter_tool",
            description: "Assemble the final report markdown. Pass content as an object \
                          with title, summary, key_findings (list of {title, body}), \
                          sections (list of {heading, body}) and references (list of \
                          {title, url}).",
            fields: vec![
                FieldSpec::required("content", FieldKind::Json, "structured report input"),
                FieldSpec::optional(
                    "format",
                    FieldKind::Choice(vec!["markdown"]),
                    "output format",
                ),
                FieldSpec::optional(
                    "style",
                    FieldKind::Choice(vec!["standard", "academic", "business"]),
                    "report style (default standard)",
                ),
            ],
        }
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<ToolReply> {
        let Some(content) = args.get("content").filter(|v| v.is_object()) else {
            return ToolReply::failure("content must be an object");
        };
        let style = args["style"].as_str().unwrap_or("standard");
        let markdown = render_report(content, style);
        ToolReply::success(json!({"markdown": markdown}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> Value {
        json!({
            "title": "Grid Storage Outlook",
            "summary": "Storage costs keep falling.",
            "key_findings": [
                {"title": "Costs", "body": "down 30% since 2021"},
                "Deployment is accelerating"
            ],
            "sections": [
                {"heading": "Market", "body": "Utilities are buying."}
            ],
            "references": [
                {"title": "IEA report", "url": "https://iea.example/report"},
                "Unlinked source note"
            ]
        })
    }

    #[test]
    fn skeleton_contains_mandatory_sections() {
        let markdown = render_report(&content(), "standard");
        assert!(markdown.starts_with("# Grid Storage Outlook"));
        assert!(markdown.contains("## Executive Summary"));
        assert!(markdown.contains("## Key Findings"));
        assert!(markdown.contains("1. **Costs:** down 30% since 2021"));
        assert!(markdown.contains("2. Deployment is accelerating"));
        assert!(markdown.contains("## Market"));
        assert!(markdown.contains("## References"));
        assert!(markdown.contains("1. [IEA report](https://iea.example/report)"));
        assert!(markdown.contains("2. Unlinked source note"));
    }

    #[test]
    fn empty_sections_still_produce_a_body_heading() {
        let markdown = render_report(&json!({"title": "T", "summary": "S"}), "standard");
        assert!(markdown.contains("## Discussion"));
        assert!(markdown.contains("## References"));
    }

    #[tokio::test]
    async fn non_object_content_is_rejected_as_failure() {
        let reply = ReportFormatterTool
            .invoke(json!({"content": "just a string"}))
            .await
            .expect("invoke");
        assert!(matches!(reply, ToolReply::Failure(_)));
    }
}
