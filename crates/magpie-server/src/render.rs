use magpie_types::Report;
use serde_json::{json, Value};

/// Lightweight markdown rendering for the report endpoints. Reports are
/// produced by our own writer, so only the constructs the skeleton uses
/// need to round-trip: headings, paragraphs, numbered lists and links.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut html = String::from("<!doctype html>\n<html><body>\n");
    let mut in_list = false;
    for line in markdown.lines() {
        let trimmed = line.trim();
        let is_list_item = trimmed
            .split_once(". ")
            .map(|(n, _)| n.chars().all(|c| c.is_ascii_digit()) && !n.is_empty())
            .unwrap_or(false);
        if in_list && !is_list_item {
            html.push_str("</ol>\n");
            in_list = false;
        }
        if trimmed.is_empty() {
            continue;
        }
        if let Some(title) = trimmed.strip_prefix("### ") {
            html.push_str(&format!("<h3>{}</h3>\n", inline_html(title)));
        } else if let Some(title) = trimmed.strip_prefix("## ") {
            html.push_str(&format!("<h2>{}</h2>\n", inline_html(title)));
        } else if let Some(title) = trimmed.strip_prefix("# ") {
            html.push_str(&format!("<h1>{}</h1>\n", inline_html(title)));
        } else if is_list_item {
            if !in_list {
                html.push_str("<ol>\n");
                in_list = true;
            }
            let item = trimmed.split_once(". ").map(|(_, rest)| rest).unwrap_or("");
            html.push_str(&format!("<li>{}</li>\n", inline_html(item)));
        } else {
            html.push_str(&format!("<p>{}</p>\n", inline_html(trimmed)));
        }
    }
    if in_list {
        html.push_str("</ol>\n");
    }
    html.push_str("</body></html>\n");
    html
}

fn inline_html(text: &str) -> String {
    let escaped = text
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    let link = regex_lite_links(&escaped);
    bold_spans(&link)
}

fn regex_lite_links(text: &str) -> String {
    // [label](url) without pulling a markdown parser in
    let mut out = String::new();
    let mut rest = text;
    while let Some(start) = rest.find('[') {
        let Some(mid) = rest[start..].find("](") else {
            break;
        };
        let Some(end) = rest[start + mid..].find(')') else {
            break;
        };
        let label = &rest[start + 1..start + mid];
        let url = &rest[start + mid + 2..start + mid + end];
        out.push_str(&rest[..start]);
        if url.starts_with("http://") || url.starts_with("https://") {
            out.push_str(&format!("<a href=\"{url}\">{label}</a>"));
        } else {
            out.push_str(&rest[start..start + mid + end + 1]);
        }
        rest = &rest[start + mid + end + 1..];
    }
    out.push_str(rest);
    out
}

fn bold_spans(text: &str) -> String {
    let mut out = String::new();
    let mut open = false;
    let mut rest = text;
    while let Some(index) = rest.find("**") {
        out.push_str(&rest[..index]);
        out.push_str(if open { "</strong>" } else { "<strong>" });
        open = !open;
        rest = &rest[index + 2..];
    }
    out.push_str(rest);
    if open {
        out.push_str("</strong>");
    }
    out
}

/// Plain-text rendering: markdown markers dropped, links reduced to
/// `label (url)`.
pub fn markdown_to_text(markdown: &str) -> String {
    let mut out = String::new();
    for line in markdown.lines() {
        let mut line = line.trim_start_matches('#').trim_start().to_string();
        line = line.replace("**", "");
        // [label](url) -> label (url)
        while let Some(start) = line.find('[') {
            let Some(mid) = line[start..].find("](") else {
                break;
            };
            let Some(end) = line[start + mid..].find(')') else {
                break;
            };
            let label = line[start + 1..start + mid].to_string();
            let url = line[start + mid + 2..start + mid + end].to_string();
            line.replace_range(start..start + mid + end + 1, &format!("{label} ({url})"));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out.trim().to_string()
}

pub fn report_as(report: &Report, format: &str) -> (String, String) {
    match format {
        "markdown" => ("text/markdown; charset=utf-8".to_string(), report.content.clone()),
        "html" => (
            "text/html; charset=utf-8".to_string(),
            markdown_to_html(&report.content),
        ),
        "text" => (
            "text/plain; charset=utf-8".to_string(),
            markdown_to_text(&report.content),
        ),
        _ => (
            "application/json".to_string(),
            serde_json::to_string(&report_json(report)).unwrap_or_default(),
        ),
    }
}

pub fn report_json(report: &Report) -> Value {
    json!({
        "id": report.id,
        "session_id": report.session_id,
        "content": report.content,
        "summary": report.summary,
        "keyFindings": report.key_findings,
        "word_count": report.word_count,
        "created_at": report.created_at,
    })
}

pub fn download_extension(format: &str) -> &'static str {
    match format {
        "html" => "html",
        "text" => "txt",
        "json" => "json",
        _ => "md",
    }
}
