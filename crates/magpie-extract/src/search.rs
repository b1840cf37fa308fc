use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: String,
    pub max_results: usize,
    pub language: Option<String>,
    pub time_range: Option<String>,
    pub allowed_domains: Option<Vec<String>>,
    pub blocked_domains: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub engine: String,
    pub score: f64,
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> anyhow::Result<Vec<SearchHit>>;
}

/// SearXNG metasearch client. One request per invocation; overlap happens
/// only across sessions.
pub struct SearxClient {
    endpoint: String,
    client: reqwest::Client,
}

impl SearxClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl SearchBackend for SearxClient {
    async fn search(&self, query: &SearchQuery) -> anyhow::Result<Vec<SearchHit>> {
        let url = format!("{}/search", self.endpoint);
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.query.clone()),
            ("format", "json".to_string()),
        ];
        if let Some(language) = query.language.as_deref() {
            params.push(("language", language.to_string()));
        }
        if let Some(range) = query.time_range.as_deref().and_then(map_time_range) {
            params.push(("time_range", range.to_string()));
        }

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=3u32 {
            let response = self.client.get(&url).query(&params).send().await;
            match response {
                Ok(resp) if resp.status().is_success() => {
                    let body: serde_json::Value = resp.json().await?;
                    return Ok(shape_results(&body, query));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if !(status.as_u16() == 429 || status.is_server_error()) {
                        anyhow::bail!("search endpoint returned status {status}");
                    }
                    last_err = Some(anyhow::anyhow!("search endpoint returned status {status}"));
                }
                Err(err) => {
                    if !(err.is_timeout() || err.is_connect() || err.is_request()) {
                        return Err(err.into());
                    }
                    last_err = Some(err.into());
                }
            }
            if attempt < 3 {
                tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("search failed")))
    }
}

/// Map the user-facing date ranges ("7d", "1m", "1y") onto the engine's
/// fixed buckets.
pub fn map_time_range(range: &str) -> Option<&'static str> {
    let range = range.trim().to_ascii_lowercase();
    if range.is_empty() {
        return None;
    }
    let unit = range.chars().last()?;
    let count: u64 = range[..range.len() - 1].parse().ok()?;
    match unit {
        'd' if count <= 1 => Some("day"),
        'd' if count <= 7 => Some("week"),
        'd' if count <= 31 => Some("month"),
        'd' => Some("year"),
        'w' if count <= 1 => Some("week"),
        'w' if count <= 4 => Some("month"),
        'w' => Some("year"),
        'm' if count <= 1 => Some("month"),
        'm' => Some("year"),
        'y' => Some("year"),
        _ => None,
    }
}

fn shape_results(body: &serde_json::Value, query: &SearchQuery) -> Vec<SearchHit> {
    let raw = body
        .get("results")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut seen = HashSet::new();
    let mut hits = Vec::new();
    for item in raw {
        let Some(url) = item.get("url").and_then(|v| v.as_str()) else {
            continue;
        };
        let normalized = normalize_url(url);
        if !seen.insert(normalized) {
            continue;
        }
        if !domain_allowed(
            url,
            query.allowed_domains.as_deref(),
            query.blocked_domains.as_deref(),
        ) {
            continue;
        }
        hits.push(SearchHit {
            url: url.to_string(),
            title: item
                .get("title")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            snippet: item
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            engine: item
                .get("engine")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            score: item.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0),
        });
        if query.max_results > 0 && hits.len() >= query.max_results {
            break;
        }
    }
    hits
}

const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "msclkid", "ref", "ref_src"];

/// Canonical form used for dedup: scheme + host + path, fragment dropped,
/// tracking query params removed, remaining params kept in order.
pub fn normalize_url(raw: &str) -> String {
    let Ok(mut parsed) = Url::parse(raw) else {
        return raw.trim().to_string();
    };
    parsed.set_fragment(None);
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            !key.starts_with("utm_") && !TRACKING_PARAMS.contains(&key.as_str())
        })
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        parsed.set_query(Some(&query));
    }
    let mut out = parsed.to_string();
    if out.ends_with('/') && parsed.path() == "/" {
        out.pop();
    }
    out
}

/// Allowed/blocked domain filters; a domain entry matches the host itself
/// or any subdomain.
pub fn domain_allowed(
    raw_url: &str,
    allowed: Option<&[String]>,
    blocked: Option<&[String]>,
) -> bool {
    let Some(host) = Url::parse(raw_url).ok().and_then(|u| u.host_str().map(str::to_string))
    else {
        return false;
    };
    let host = host.to_ascii_lowercase();
    let matches = |domain: &String| {
        let domain = domain.trim_start_matches("www.").to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    };
    if let Some(blocked) = blocked {
        if blocked.iter().any(matches) {
            return false;
        }
    }
    if let Some(allowed) = allowed {
        if !allowed.is_empty() && !allowed.iter().any(matches) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_normalization_strips_fragments_and_tracking() {
        assert_eq!(
            normalize_url("https://example.org/a?utm_source=x&id=2#section"),
            "https://example.org/a?id=2"
        );
        assert_eq!(
            normalize_url("https://example.org/a?fbclid=abc"),
            "https://example.org/a"
        );
        assert_eq!(
            normalize_url("https://Example.org/"),
            "https://example.org"
        );
    }

    #[test]
    fn domain_filters_match_subdomains() {
        let allowed = vec!["example.org".to_string()];
        let blocked = vec!["spam.net".to_string()];
        assert!(domain_allowed("https://news.example.org/x", Some(&allowed), Some(&blocked)));
        assert!(!domain_allowed("https://other.com/x", Some(&allowed), Some(&blocked)));
        assert!(!domain_allowed("https://a.spam.net/x", None, Some(&blocked)));
        assert!(domain_allowed("https://anything.io/x", None, None));
    }

    #[test]
    fn time_ranges_map_to_engine_buckets() {
        assert_eq!(map_time_range("1d"), Some("day"));
        assert_eq!(map_time_range("7d"), Some("week"));
        assert_eq!(map_time_range("1m"), Some("month"));
        assert_eq!(map_time_range("1y"), Some("year"));
        assert_eq!(map_time_range("soon"), None);
    }

    #[test]
    fn results_are_deduplicated_and_filtered() {
        let body = json!({
            "results": [
                {"url": "https://a.example/post?utm_source=feed", "title": "A", "content": "first", "engine": "duckduckgo", "score": 1.5},
                {"url": "https://a.example/post", "title": "A again", "content": "dup", "engine": "brave", "score": 1.0},
                {"url": "https://blocked.net/item", "title": "B", "content": "nope", "engine": "brave", "score": 0.9},
                {"url": "https://b.example/other", "title": "C", "content": "second", "engine": "brave", "score": 0.8}
            ]
        });
        let query = SearchQuery {
            query: "anything".to_string(),
            max_results: 10,
            blocked_domains: Some(vec!["blocked.net".to_string()]),
            ..Default::default()
        };
        let hits = shape_results(&body, &query);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "A");
        assert_eq!(hits[1].title, "C");
    }

    #[test]
    fn max_results_caps_the_set() {
        let results: Vec<_> = (0..20)
            .map(|i| json!({"url": format!("https://site{i}.example/x"), "title": "t", "content": "c", "engine": "e", "score": 0.1}))
            .collect();
        let body = json!({ "results": results });
        let query = SearchQuery {
            query: "q".to_string(),
            max_results: 5,
            ..Default::default()
        };
        assert_eq!(shape_results(&body, &query).len(), 5);
    }
}
