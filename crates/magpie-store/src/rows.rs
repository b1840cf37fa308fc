use chrono::{DateTime, Utc};
use rusqlite::Row;

use magpie_types::{
    Citation, Report, ResearchData, ResearchDataType, ResearchParameters, ResearchSession,
    SessionStatus, Source,
};

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

pub(crate) fn session_from_row(row: &Row<'_>) -> rusqlite::Result<ResearchSession> {
    let status_raw: String = row.get(3)?;
    let parameters_raw: String = row.get(4)?;
    Ok(ResearchSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        topic: row.get(2)?,
        status: SessionStatus::parse(&status_raw).unwrap_or(SessionStatus::Failed),
        parameters: serde_json::from_str::<ResearchParameters>(&parameters_raw)
            .unwrap_or_default(),
        created_at: parse_timestamp(row.get(5)?),
        started_at: parse_opt_timestamp(row.get(6)?),
        completed_at: parse_opt_timestamp(row.get(7)?),
        error_message: row.get(8)?,
        report_id: row.get(9)?,
    })
}

pub(crate) fn report_from_row(row: &Row<'_>) -> rusqlite::Result<Report> {
    let key_findings_raw: String = row.get(4)?;
    Ok(Report {
        id: row.get(0)?,
        session_id: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        key_findings: serde_json::from_str(&key_findings_raw).unwrap_or_default(),
        word_count: row.get(5)?,
        created_at: parse_timestamp(row.get(6)?),
    })
}

pub(crate) fn source_from_row(row: &Row<'_>) -> rusqlite::Result<Source> {
    let metadata_raw: Option<String> = row.get(8)?;
    Ok(Source {
        id: row.get(0)?,
        session_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        summary: row.get(5)?,
        relevance_score: row.get(6)?,
        accessed_at: parse_timestamp(row.get(7)?),
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

pub(crate) fn citation_from_row(row: &Row<'_>) -> rusqlite::Result<Citation> {
    Ok(Citation {
        id: row.get(0)?,
        report_id: row.get(1)?,
        source_id: row.get(2)?,
        quote: row.get(3)?,
        context: row.get(4)?,
        position: row.get(5)?,
    })
}

pub(crate) fn research_data_from_row(row: &Row<'_>) -> rusqlite::Result<ResearchData> {
    let data_type_raw: String = row.get(2)?;
    let metadata_raw: Option<String> = row.get(6)?;
    Ok(ResearchData {
        id: row.get(0)?,
        session_id: row.get(1)?,
        data_type: ResearchDataType::parse(&data_type_raw)
            .unwrap_or(ResearchDataType::ExtractedContent),
        query: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        metadata: metadata_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
        relevance_score: row.get(7)?,
        created_at: parse_timestamp(row.get(8)?),
    })
}
