use magpie_types::{ReportLength, ResearchParameters};

pub fn research_system_prompt() -> String {
    "You are a research agent gathering sources for a report. Work in small steps: \
     plan queries, run `search_tool`, then persist every useful page with \
     `database_tool` action `store` (data_type `extracted_content`, the page text as \
     content, and the url inside metadata). Vary query phrasings to broaden coverage \
     and prefer primary sources. When you have stored enough material, reply with a \
     short plain-text recap of what was collected."
        .to_string()
}

pub fn analyze_system_prompt() -> String {
    "You are an analysis agent. Read the stored research with `database_tool` \
     (retrieve_sources, get_summary), then work through it with `analysis_tool`, \
     `fact_check_tool` and `relevance_scoring_tool`. Identify patterns, \
     contradictions between sources, and your confidence in each conclusion. \
     Persist your analysis with `database_tool` action `store` using data_type \
     `analysis`, then reply with a short recap."
        .to_string()
}

pub fn write_system_prompt() -> String {
    "You are a report writer. Pull the stored material with `database_tool` \
     (retrieve_sources) and assemble the final report with `report_formatter_tool`. \
     The report must contain these sections in order: `# <title>`, \
     `## Executive Summary`, `## Key Findings` (numbered `1. **Title:** body` items), \
     at least one body section, and `## References` (numbered, linking source urls). \
     Cite sources inline as markdown links where claims need support. Your final \
     reply must be ONLY the complete report markdown."
        .to_string()
}

pub fn research_task_prompt(topic: &str, parameters: &ResearchParameters) -> String {
    let mut constraints = vec![
        format!(
            "collect between {} and {} good sources",
            parameters.min_sources, parameters.max_sources
        ),
        format!("depth: {:?}", parameters.depth).to_lowercase(),
        format!("language: {}", parameters.language),
    ];
    if let Some(range) = parameters.date_range.as_deref() {
        constraints.push(format!("prefer material from the last {range}"));
    }
    if let Some(domains) = parameters.allowed_domains.as_ref().filter(|d| !d.is_empty()) {
        constraints.push(format!("restrict to domains: {}", domains.join(", ")));
    }
    format!(
        "Research topic: {topic}\n\nConstraints: {}.",
        constraints.join("; ")
    )
}

pub fn analyze_task_prompt(topic: &str) -> String {
    format!(
        "Analyze the stored research about: {topic}\n\nCover recurring patterns, \
         contradictions between sources, and confidence estimates for the main \
         conclusions."
    )
}

pub fn write_task_prompt(topic: &str, parameters: &ResearchParameters) -> String {
    let target_words = match parameters.report_length {
        ReportLength::Short => 400,
        ReportLength::Medium => 900,
        ReportLength::Long => 1800,
        ReportLength::Comprehensive => 3200,
    };
    format!(
        "Write the final research report on: {topic}\n\nTarget roughly {target_words} \
         words. Ground every finding in the stored sources and cite them."
    )
}

/// Single-shot repair prompt used when the drafted report misses mandatory
/// sections.
pub fn repair_task_prompt(draft: &str, problems: &str) -> String {
    format!(
        "The report below is missing required sections ({problems}). Rewrite it as \
         complete markdown with exactly these sections in order: `# <title>`, \
         `## Executive Summary`, `## Key Findings` (numbered items), at least one \
         body section, `## References` (numbered). Keep all existing content that \
         fits. Reply with ONLY the corrected markdown.\n\n---\n\n{draft}"
    )
}
