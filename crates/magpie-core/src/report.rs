use regex::Regex;

use magpie_types::CitationDraft;

/// The section skeleton every finished report must obey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkeletonError {
    pub missing: Vec<&'static str>,
}

impl std::fmt::Display for SkeletonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "report is missing sections: {}", self.missing.join(", "))
    }
}

impl std::error::Error for SkeletonError {}

pub fn validate_skeleton(markdown: &str) -> Result<(), SkeletonError> {
    let mut missing = Vec::new();
    if !markdown.lines().any(|line| {
        let trimmed = line.trim_start();
        trimmed.starts_with("# ") && !trimmed.starts_with("## ")
    }) {
        missing.push("# Title");
    }
    if !has_heading(markdown, "Executive Summary") {
        missing.push("## Executive Summary");
    }
    if !has_heading(markdown, "Key Findings") {
        missing.push("## Key Findings");
    }
    if !has_heading(markdown, "References") {
        missing.push("## References");
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SkeletonError { missing })
    }
}

fn has_heading(markdown: &str, heading: &str) -> bool {
    markdown
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case(&format!("## {heading}")))
}

/// Text of a `##` section, up to the next `##` heading.
pub fn section_body<'a>(markdown: &'a str, heading: &str) -> Option<String> {
    let mut collecting = false;
    let mut body = Vec::new();
    for line in markdown.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(&format!("## {heading}")) {
            collecting = true;
            continue;
        }
        if collecting && trimmed.starts_with("## ") {
            break;
        }
        if collecting {
            body.push(line);
        }
    }
    if body.is_empty() && !collecting {
        return None;
    }
    Some(body.join("\n").trim().to_string())
}

pub fn extract_summary(markdown: &str) -> String {
    section_body(markdown, "Executive Summary").unwrap_or_default()
}

/// Numbered items under Key Findings, with markdown emphasis stripped.
pub fn extract_key_findings(markdown: &str) -> Vec<String> {
    let Some(body) = section_body(markdown, "Key Findings") else {
        return Vec::new();
    };
    let numbered = Regex::new(r"^\s*\d+\.\s+(.*)$").expect("numbered item regex");
    body.lines()
        .filter_map(|line| {
            numbered
                .captures(line)
                .map(|cap| cap[1].replace("**", "").trim().to_string())
        })
        .filter(|item| !item.is_empty())
        .collect()
}

/// Citations: numbered entries under References first, then inline
/// `[text](http…)` links from the rest of the document whose URLs were not
/// already collected. Order defines position.
pub fn extract_citations(markdown: &str) -> Vec<CitationDraft> {
    let link = Regex::new(r"\[([^\]]+)\]\((https?://[^)\s]+)\)").expect("link regex");
    let numbered = Regex::new(r"^\s*\d+\.\s+(.*)$").expect("numbered item regex");

    let mut citations: Vec<CitationDraft> = Vec::new();
    let mut seen_urls = Vec::new();

    if let Some(references) = section_body(markdown, "References") {
        for line in references.lines() {
            let Some(cap) = numbered.captures(line) else {
                continue;
            };
            let entry = cap[1].trim().to_string();
            if entry.is_empty() {
                continue;
            }
            if let Some(link_cap) = link.captures(&entry) {
                let url = link_cap[2].to_string();
                seen_urls.push(url.clone());
                citations.push(CitationDraft {
                    quote: link_cap[1].to_string(),
                    context: None,
                    source_url: Some(url),
                });
            } else {
                citations.push(CitationDraft {
                    quote: entry.replace("**", ""),
                    context: None,
                    source_url: None,
                });
            }
        }
    }

    let body_without_references = match markdown.find("## References") {
        Some(index) => &markdown[..index],
        None => markdown,
    };
    for cap in link.captures_iter(body_without_references) {
        let url = cap[2].to_string();
        if seen_urls.contains(&url) {
            continue;
        }
        seen_urls.push(url.clone());
        citations.push(CitationDraft {
            quote: cap[1].to_string(),
            context: None,
            source_url: Some(url),
        });
    }

    citations
}

pub fn report_title(markdown: &str) -> Option<String> {
    markdown.lines().find_map(|line| {
        let trimmed = line.trim();
        trimmed
            .strip_prefix("# ")
            .map(|title| title.trim().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = "# Grid Storage Outlook\n\n\
        ## Executive Summary\n\nStorage costs keep falling and deployment is accelerating.\n\n\
        ## Key Findings\n\n\
        1. **Costs:** down 30% since 2021\n\
        2. **Deployment:** utilities are buying at scale\n\n\
        ## Market Details\n\nSee [IEA outlook](https://iea.example/outlook) for volume data.\n\n\
        ## References\n\n\
        1. [IEA report](https://iea.example/report)\n\
        2. Field interviews, 2024\n";

    #[test]
    fn skeleton_validation_passes_and_fails() {
        validate_skeleton(REPORT).expect("valid");
        let err = validate_skeleton("# T\n\nno sections here").expect_err("invalid");
        assert!(err.missing.contains(&"## Executive Summary"));
        assert!(err.missing.contains(&"## Key Findings"));
    }

    #[test]
    fn summary_is_the_executive_summary_body() {
        assert_eq!(
            extract_summary(REPORT),
            "Storage costs keep falling and deployment is accelerating."
        );
    }

    #[test]
    fn key_findings_are_numbered_items_without_emphasis() {
        let findings = extract_key_findings(REPORT);
        assert_eq!(
            findings,
            vec![
                "Costs: down 30% since 2021",
                "Deployment: utilities are buying at scale",
            ]
        );
    }

    #[test]
    fn citations_combine_references_and_inline_links() {
        let citations = extract_citations(REPORT);
        assert_eq!(citations.len(), 3);
        assert_eq!(citations[0].quote, "IEA report");
        assert_eq!(
            citations[0].source_url.as_deref(),
            Some("https://iea.example/report")
        );
        assert_eq!(citations[1].quote, "Field interviews, 2024");
        assert!(citations[1].source_url.is_none());
        assert_eq!(
            citations[2].source_url.as_deref(),
            Some("https://iea.example/outlook"),
            "inline link not present in references is appended"
        );
    }

    #[test]
    fn inline_only_citations_keep_document_order() {
        let markdown = "# T\n\n## Executive Summary\n\nS\n\n## Key Findings\n\n1. A\n\n\
            ## Body\n\n[Finding A](https://a.example) then [Finding B](https://b.example)\n\n\
            ## References\n";
        let citations = extract_citations(markdown);
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].source_url.as_deref(), Some("https://a.example"));
        assert_eq!(citations[1].source_url.as_deref(), Some("https://b.example"));
    }

    #[test]
    fn title_extraction() {
        assert_eq!(report_title(REPORT).as_deref(), Some("Grid Storage Outlook"));
    }
}
