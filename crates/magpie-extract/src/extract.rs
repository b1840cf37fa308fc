use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};

pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXTRACT_CONCURRENCY: usize = 3;
const MIN_CONTENT_CHARS: usize = 100;
const MAX_REDIRECTS: usize = 5;

/// Outcome of one extraction. Failures are carried in `error`; the
/// extractor never propagates an Err into its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub url: String,
    pub title: String,
    pub content: String,
    pub text_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExtractedPage {
    pub fn failure(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            title: String::new(),
            content: String::new(),
            text_length: 0,
            published_date: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> ExtractedPage;

    /// Batch extraction with a concurrency cap; result order matches input.
    async fn extract_many(&self, urls: Vec<String>, concurrency: usize) -> Vec<ExtractedPage> {
        stream::iter(urls)
            .map(|url| async move { self.extract(&url).await })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}

pub struct Extractor {
    client: reqwest::Client,
    timeout: Duration,
}

impl Extractor {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_EXTRACT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, timeout }
    }

    pub fn shared() -> Arc<dyn ContentExtractor> {
        Arc::new(Self::new())
    }

    async fn fetch(&self, url: &str) -> Result<(String, String), String> {
        let mut last_error = String::new();
        for attempt in 1..=3u32 {
            let result = self
                .client
                .get(url)
                .header(
                    "User-Agent",
                    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
                )
                .header(
                    "Accept",
                    "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
                )
                .header("Accept-Language", "en-US,en;q=0.5")
                .send()
                .await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let content_type = response
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("text/html")
                            .to_string();
                        return match response.text().await {
                            Ok(body) => Ok((content_type, body)),
                            Err(err) => Err(format!("failed to read body: {err}")),
                        };
                    }
                    last_error = format!("http status {status}");
                    if !(status.as_u16() == 429 || status.is_server_error()) {
                        return Err(last_error);
                    }
                }
                Err(err) => {
                    last_error = format!("request failed: {err}");
                    if !(err.is_timeout() || err.is_connect() || err.is_request()) {
                        return Err(last_error);
                    }
                }
            }
            if attempt < 3 {
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            }
        }
        Err(last_error)
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentExtractor for Extractor {
    async fn extract(&self, url: &str) -> ExtractedPage {
        let started = std::time::Instant::now();
        let (content_type, body) = match self.fetch(url).await {
            Ok(pair) => pair,
            Err(error) => {
                tracing::debug!(url, error = %error, "extraction fetch failed");
                return ExtractedPage::failure(url, error);
            }
        };
        if started.elapsed() > self.timeout {
            return ExtractedPage::failure(url, "extraction timed out");
        }

        if content_type.contains("html") {
            extract_from_html(url, &body)
        } else if content_type.starts_with("text/") || content_type.contains("json") {
            let content = collapse_whitespace(&body);
            ExtractedPage {
                url: url.to_string(),
                title: String::new(),
                text_length: content.chars().count(),
                content,
                published_date: None,
                error: None,
            }
        } else {
            ExtractedPage::failure(url, format!("unsupported content type `{content_type}`"))
        }
    }
}

/// Parse and mine an HTML document. Runs synchronously; `Html` is not Send
/// so nothing here may live across an await point.
pub fn extract_from_html(url: &str, body: &str) -> ExtractedPage {
    let doc = Html::parse_document(body);

    let title = document_title(&doc);
    let published_date = published_date(&doc);

    let content = readability_pass(&doc)
        .filter(|text| text.chars().count() >= MIN_CONTENT_CHARS)
        .or_else(|| selector_fallback(&doc))
        .map(|text| collapse_whitespace(&text))
        .unwrap_or_default();

    if content.chars().count() < MIN_CONTENT_CHARS {
        return ExtractedPage {
            title,
            published_date,
            ..ExtractedPage::failure(url, "no readable content found")
        };
    }

    ExtractedPage {
        url: url.to_string(),
        title,
        text_length: content.chars().count(),
        content,
        published_date,
        error: None,
    }
}

const STRIPPED_TAGS: &[&str] = &["script", "style", "noscript", "iframe", "img", "form"];

/// Text of an element excluding stripped tags, with block boundaries
/// rendered as newlines.
fn block_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    collect_text(el, &mut out);
    out
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    const BLOCK_TAGS: &[&str] = &[
        "p", "div", "section", "article", "li", "br", "h1", "h2", "h3", "h4", "h5", "h6", "tr",
        "blockquote", "pre",
    ];
    for child in el.children() {
        match child.value() {
            scraper::Node::Text(text) => out.push_str(text),
            scraper::Node::Element(element) => {
                let name = element.name();
                if STRIPPED_TAGS.contains(&name) {
                    continue;
                }
                if BLOCK_TAGS.contains(&name) {
                    out.push('\n');
                }
                if let Some(child_ref) = ElementRef::wrap(child) {
                    collect_text(child_ref, out);
                }
                if BLOCK_TAGS.contains(&name) {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Readability-style pass: score candidate containers by text volume
/// discounted by link density, keep the best.
fn readability_pass(doc: &Html) -> Option<String> {
    let candidates = Selector::parse("article, main, section, div").ok()?;
    let anchors = Selector::parse("a").ok()?;

    let mut best: Option<(f64, String)> = None;
    for el in doc.select(&candidates) {
        let text = block_text(el);
        let text_len = text.split_whitespace().map(str::len).sum::<usize>();
        if text_len < MIN_CONTENT_CHARS {
            continue;
        }
        let link_len = el
            .select(&anchors)
            .map(|a| a.text().map(str::len).sum::<usize>())
            .sum::<usize>();
        let link_density = link_len as f64 / text_len.max(1) as f64;
        if link_density > 0.6 {
            continue;
        }
        let score = text_len as f64 * (1.0 - link_density);
        if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
            best = Some((score, text));
        }
    }
    best.map(|(_, text)| text)
}

/// CSS heuristics, in priority order; the first selector producing enough
/// text wins.
fn selector_fallback(doc: &Html) -> Option<String> {
    const FALLBACK_SELECTORS: &[&str] =
        &["main", "article", "[role=main]", "#content", ".content", "body"];
    for raw in FALLBACK_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            let text = block_text(el);
            if text.chars().filter(|c| !c.is_whitespace()).count() >= MIN_CONTENT_CHARS {
                return Some(text);
            }
        }
    }
    None
}

fn document_title(doc: &Html) -> String {
    if let Ok(selector) = Selector::parse("title") {
        if let Some(el) = doc.select(&selector).next() {
            let title = el.text().collect::<String>().trim().to_string();
            if !title.is_empty() {
                return title;
            }
        }
    }
    if let Ok(selector) = Selector::parse("meta[property=\"og:title\"]") {
        if let Some(el) = doc.select(&selector).next() {
            if let Some(content) = el.value().attr("content") {
                return content.trim().to_string();
            }
        }
    }
    String::new()
}

/// Publication date discovery: meta tags, `<time datetime>`, then JSON-LD.
fn published_date(doc: &Html) -> Option<String> {
    const META_SELECTORS: &[&str] = &[
        "meta[property=\"article:published_time\"]",
        "meta[name=\"pubdate\"]",
        "meta[name=\"date\"]",
        "meta[property=\"og:updated_time\"]",
        "meta[name=\"DC.date.issued\"]",
    ];
    for raw in META_SELECTORS {
        let Ok(selector) = Selector::parse(raw) else {
            continue;
        };
        if let Some(el) = doc.select(&selector).next() {
            if let Some(date) = el.value().attr("content").and_then(normalize_date) {
                return Some(date);
            }
        }
    }

    if let Ok(selector) = Selector::parse("time[datetime]") {
        if let Some(el) = doc.select(&selector).next() {
            if let Some(date) = el.value().attr("datetime").and_then(normalize_date) {
                return Some(date);
            }
        }
    }

    if let Ok(selector) = Selector::parse("script[type=\"application/ld+json\"]") {
        for el in doc.select(&selector) {
            let raw = el.text().collect::<String>();
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            if let Some(date) = find_json_ld_date(&value).and_then(|d| normalize_date(&d)) {
                return Some(date);
            }
        }
    }
    None
}

fn find_json_ld_date(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(date) = map.get("datePublished").and_then(|v| v.as_str()) {
                return Some(date.to_string());
            }
            map.values().find_map(find_json_ld_date)
        }
        serde_json::Value::Array(arr) => arr.iter().find_map(find_json_ld_date),
        _ => None,
    }
}

/// Normalize assorted date spellings to ISO-8601.
pub fn normalize_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.to_rfc3339());
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc2822(raw) {
        return Some(dt.to_rfc3339());
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, format) {
            return Some(format!("{}Z", dt.format("%Y-%m-%dT%H:%M:%S")));
        }
    }
    for format in ["%Y-%m-%d", "%Y/%m/%d", "%d %B %Y", "%B %d, %Y"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

/// Collapse runs of horizontal whitespace to one space and runs of three or
/// more newlines to a blank line.
pub fn collapse_whitespace(input: &str) -> String {
    let horizontal = Regex::new(r"[ \t\r\x0b\x0c]+").expect("whitespace regex");
    let spaced_newlines = Regex::new(r" ?\n ?").expect("newline trim regex");
    let newline_runs = Regex::new(r"\n{3,}").expect("newline run regex");

    let collapsed = horizontal.replace_all(input, " ");
    let collapsed = spaced_newlines.replace_all(&collapsed, "\n");
    let collapsed = newline_runs.replace_all(&collapsed, "\n\n");
    collapsed.trim().to_string()
}
