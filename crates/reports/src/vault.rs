use anyhow::{Context, Result};
use attendance_core::db;
use attendance_core::reconcile::{Confidence, MissedCandidate, Placement, ReconciliationReport};
use log::info;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub struct VaultPaths {
    pub root: PathBuf,
    pub index_dir: PathBuf,
    pub batches_dir: PathBuf,
    pub reconciliations_dir: PathBuf,
}

impl VaultPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            index_dir: root.join("00_Index"),
            batches_dir: root.join("Batches"),
            reconciliations_dir: root.join("Reconciliations"),
            root,
        }
    }

    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(&self.index_dir)?;
        fs::create_dir_all(&self.batches_dir)?;
        fs::create_dir_all(&self.reconciliations_dir)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaultSummary {
    pub batches: usize,
    pub reconciliations: usize,
}

/// Regenerates every note and index from the audit store.
pub fn build_vault(conn: &Connection, vault_root: &Path) -> Result<VaultSummary> {
    let paths = VaultPaths::new(vault_root);
    paths.ensure()?;
    let generated_at = OffsetDateTime::now_utc().format(&Rfc3339)?;

    // 1) Batch notes
    let mut stmt = conn.prepare(
        r#"
        SELECT id, campaign, mode, input_count, rendered, delivered, transport_failures,
               skipped, failed, cancelled, not_attempted, paced_ms, recorded_at
        FROM batch_runs
        ORDER BY id DESC
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(BatchRow {
            id: row.get(0)?,
            campaign: row.get(1)?,
            mode: row.get(2)?,
            input_count: row.get(3)?,
            rendered: row.get(4)?,
            delivered: row.get(5)?,
            transport_failures: row.get(6)?,
            skipped: row.get(7)?,
            failed: row.get(8)?,
            cancelled: row.get(9)?,
            not_attempted: row.get(10)?,
            paced_ms: row.get(11)?,
            recorded_at: row.get(12)?,
        })
    })?;

    let mut batch_index = index_header("MOC - Batches", &generated_at);
    let mut batches = 0;
    for r in rows {
        let b = r?;
        let outcomes = load_outcomes(conn, b.id)?;
        write_batch_note(&paths, &b, &outcomes)?;
        batch_index.push(format!("- [[Batches/{}|{}]]", b.note_name(), b.index_title()));
        batches += 1;
    }
    if batches == 0 {
        batch_index.push("_No batch runs recorded._".to_string());
    }
    fs::write(paths.index_dir.join("MOC - Batches.md"), batch_index.join("\n"))?;

    // 2) Reconciliation notes, grouped by confidence in the index
    let mut stmt = conn.prepare(
        r#"
        SELECT report_json, computed_at
        FROM reconciliations
        ORDER BY representative_id ASC
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut exact_links = Vec::new();
    let mut partial_links = Vec::new();
    for r in rows {
        let (json, computed_at) = r?;
        let report: ReconciliationReport =
            serde_json::from_str(&json).context("stored reconciliation report is not valid JSON")?;
        let name = note_name(&report.representative_id);
        write_reconciliation_note(&paths, &name, &report, &computed_at)?;
        let link = format!(
            "- [[Reconciliations/{name}|{}]] ({} candidates, {} missed)",
            report.representative_id,
            report.missed_candidates.len(),
            report.expected_missed
        );
        match report.confidence {
            Confidence::Exact => exact_links.push(link),
            Confidence::Partial => partial_links.push(link),
        }
    }
    let reconciliations = exact_links.len() + partial_links.len();

    let mut reconciliation_index = index_header("MOC - Reconciliations", &generated_at);
    reconciliation_index.push("## Exact".to_string());
    reconciliation_index.push(String::new());
    push_or_placeholder(&mut reconciliation_index, exact_links, "_None._");
    reconciliation_index.push(String::new());
    reconciliation_index.push("## Partial (upper bounds only)".to_string());
    reconciliation_index.push(String::new());
    push_or_placeholder(&mut reconciliation_index, partial_links, "_None._");
    fs::write(
        paths.index_dir.join("MOC - Reconciliations.md"),
        reconciliation_index.join("\n"),
    )?;

    info!(
        "wrote {batches} batch notes and {reconciliations} reconciliation notes to {}",
        paths.root.display()
    );
    Ok(VaultSummary {
        batches,
        reconciliations,
    })
}

fn index_header(title: &str, generated_at: &str) -> Vec<String> {
    vec![
        format!("# {title}"),
        String::new(),
        "This index is generated. Do not edit manually.".to_string(),
        format!("Generated: `{generated_at}`"),
        String::new(),
    ]
}

fn push_or_placeholder(lines: &mut Vec<String>, items: Vec<String>, placeholder: &str) {
    if items.is_empty() {
        lines.push(placeholder.to_string());
    } else {
        lines.extend(items);
    }
}

#[derive(Debug)]
struct BatchRow {
    id: i64,
    campaign: String,
    mode: String,
    input_count: i64,
    rendered: i64,
    delivered: i64,
    transport_failures: i64,
    skipped: i64,
    failed: i64,
    cancelled: bool,
    not_attempted: i64,
    paced_ms: i64,
    recorded_at: String,
}

impl BatchRow {
    fn note_name(&self) -> String {
        format!("batch-{:04}", self.id)
    }

    fn is_preview(&self) -> bool {
        self.mode == db::RunMode::Preview.as_str()
    }

    fn index_title(&self) -> String {
        let preview = if self.is_preview() { ", preview" } else { "" };
        format!("{} #{} ({}{preview})", self.campaign, self.id, self.recorded_at)
    }
}

#[derive(Debug)]
struct OutcomeRow {
    position: i64,
    representative_id: Option<String>,
    status: String,
    locale: Option<String>,
    tier: Option<String>,
    attendance_pct: Option<String>,
    detail: Option<String>,
}

fn load_outcomes(conn: &Connection, run_id: i64) -> Result<Vec<OutcomeRow>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT position, representative_id, status, locale, tier, attendance_pct, detail
        FROM batch_outcomes
        WHERE run_id = ?1
        ORDER BY position ASC
        "#,
    )?;
    let rows = stmt.query_map([run_id], |row| {
        Ok(OutcomeRow {
            position: row.get(0)?,
            representative_id: row.get(1)?,
            status: row.get(2)?,
            locale: row.get(3)?,
            tier: row.get(4)?,
            attendance_pct: row.get(5)?,
            detail: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn write_batch_note(paths: &VaultPaths, b: &BatchRow, outcomes: &[OutcomeRow]) -> Result<()> {
    let note_path = paths.batches_dir.join(format!("{}.md", b.note_name()));

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("id: {}\n", b.id));
    md.push_str(&format!("campaign: {}\n", b.campaign));
    md.push_str(&format!("mode: {}\n", b.mode));
    md.push_str(&format!("recorded_at: {}\n", b.recorded_at));
    md.push_str(&format!("cancelled: {}\n", b.cancelled));
    md.push_str("---\n\n");

    md.push_str(&format!("# Batch {} - {}\n\n", b.id, b.campaign));

    md.push_str("## Summary\n");
    md.push_str(&format!("- Input records: {}\n", b.input_count));
    if b.is_preview() {
        md.push_str(&format!("- Rendered: {} (preview only, nothing sent)\n", b.rendered));
    } else {
        md.push_str(&format!(
            "- Rendered: {} (delivered {}, transport failures {})\n",
            b.rendered, b.delivered, b.transport_failures
        ));
    }
    md.push_str(&format!("- Skipped: {}\n", b.skipped));
    md.push_str(&format!("- Failed: {}\n", b.failed));
    if b.cancelled {
        md.push_str(&format!("- Cancelled, {} not attempted\n", b.not_attempted));
    }
    md.push_str(&format!("- Paced: {} ms\n\n", b.paced_ms));

    md.push_str("## Outcomes\n");
    if outcomes.is_empty() {
        md.push_str("_No outcomes recorded._\n");
    } else {
        md.push_str("| # | Representative | Status | Locale | Tier | Attendance | Detail |\n");
        md.push_str("|---|---|---|---|---|---|---|\n");
        for o in outcomes {
            md.push_str(&format!(
                "| {} | {} | {} | {} | {} | {} | {} |\n",
                o.position,
                cell(o.representative_id.as_deref()),
                o.status,
                cell(o.locale.as_deref()),
                cell(o.tier.as_deref()),
                o.attendance_pct
                    .as_deref()
                    .map_or_else(|| "-".to_string(), |pct| format!("{pct}%")),
                cell(o.detail.as_deref()),
            ));
        }
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn write_reconciliation_note(
    paths: &VaultPaths,
    name: &str,
    report: &ReconciliationReport,
    computed_at: &str,
) -> Result<()> {
    let note_path = paths.reconciliations_dir.join(format!("{name}.md"));
    let confidence = match report.confidence {
        Confidence::Exact => "exact",
        Confidence::Partial => "partial",
    };

    let mut md = String::new();
    md.push_str("---\n");
    md.push_str(&format!("representative_id: {}\n", report.representative_id));
    md.push_str(&format!("confidence: {confidence}\n"));
    md.push_str(&format!("computed_at: {computed_at}\n"));
    md.push_str("---\n\n");

    md.push_str(&format!("# Missed votes - {}\n\n", report.representative_id));
    md.push_str(&format!("- Votes in period: {}\n", report.votes_total_period));
    md.push_str(&format!("- Votes cast: {}\n", report.votes_cast));
    md.push_str(&format!("- Missed (from counts): {}\n", report.expected_missed));
    md.push_str(&format!("- Attendance evidenced: {}\n\n", report.evidenced));

    match report.confidence {
        Confidence::Exact => {
            md.push_str("## Missed votes\n");
            push_candidates(&mut md, report.missed_candidates.iter());
        }
        Confidence::Partial => {
            md.push_str(&format!(
                "> [!warning] Partial record\n> {} of {} votes cast have no participation evidence. \
                 The {} candidates below include every missed vote but also {} votes that were attended.\n\n",
                report.unevidenced_attendance,
                report.votes_cast,
                report.missed_candidates.len(),
                report.unevidenced_attendance
            ));
            md.push_str("## Candidates (most likely first)\n");
            push_candidates(&mut md, report.ranked_candidates().into_iter());
        }
    }

    fs::write(note_path, md)?;
    Ok(())
}

fn push_candidates<'a>(md: &mut String, candidates: impl Iterator<Item = &'a MissedCandidate>) {
    let mut any = false;
    for c in candidates {
        any = true;
        md.push_str(&format!("- `{}` {} - {}", c.vote.timestamp, c.vote.id, c.vote.title));
        if let Some(outcome) = &c.vote.outcome {
            md.push_str(&format!(" ({outcome})"));
        }
        match c.placement {
            Placement::BeforeFirstEvidence => md.push_str(" _before first evidenced vote_"),
            Placement::AfterLastEvidence => md.push_str(" _after last evidenced vote_"),
            Placement::Interior | Placement::Unanchored => {}
        }
        if let Some(source) = &c.vote.source_reference {
            md.push_str(&format!(" [source]({source})"));
        }
        md.push('\n');
    }
    if !any {
        md.push_str("_None._\n");
    }
}

fn cell(value: Option<&str>) -> String {
    match value {
        Some(v) if !v.is_empty() => v.replace('|', "\\|"),
        _ => "-".to_string(),
    }
}

fn note_name(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
