use anyhow::Result;
use log::error;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::path::Path;

use crate::batch::{BatchResult, OutgoingMessage, Transport};
use crate::reconcile::ReconciliationReport;

pub fn open(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    init(&conn)?;
    Ok(conn)
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS batch_runs (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          campaign TEXT NOT NULL,
          mode TEXT NOT NULL,
          input_count INTEGER NOT NULL,
          rendered INTEGER NOT NULL,
          delivered INTEGER NOT NULL,
          transport_failures INTEGER NOT NULL,
          skipped INTEGER NOT NULL,
          failed INTEGER NOT NULL,
          cancelled INTEGER NOT NULL,
          not_attempted INTEGER NOT NULL,
          paced_ms INTEGER NOT NULL,
          recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );

        CREATE TABLE IF NOT EXISTS batch_outcomes (
          run_id INTEGER NOT NULL REFERENCES batch_runs(id),
          position INTEGER NOT NULL,
          representative_id TEXT,
          status TEXT NOT NULL,
          locale TEXT,
          tier TEXT,
          attendance_pct TEXT,
          destination TEXT,
          detail TEXT,
          PRIMARY KEY (run_id, position)
        );

        CREATE TABLE IF NOT EXISTS reconciliations (
          representative_id TEXT PRIMARY KEY,
          confidence TEXT NOT NULL,
          votes_total_period INTEGER NOT NULL,
          votes_cast INTEGER NOT NULL,
          evidenced INTEGER NOT NULL,
          candidates INTEGER NOT NULL,
          report_json TEXT NOT NULL,
          computed_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now'))
        );

        CREATE TABLE IF NOT EXISTS outbox (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          representative_id TEXT NOT NULL,
          destination TEXT NOT NULL,
          locale TEXT NOT NULL,
          subject TEXT NOT NULL,
          body TEXT NOT NULL,
          queued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ','now')),
          sent_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(sent_at);
        "#,
    )?;
    Ok(())
}

/// How the rendered messages of a run left the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Printed for review; nothing was sent or queued.
    Preview,
    /// Handed to a real transport such as the outbox.
    Dispatch,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Preview => "preview",
            RunMode::Dispatch => "dispatch",
        }
    }
}

/// Stores the summary and one row per input record; returns the run id.
pub fn record_batch(
    conn: &Connection,
    campaign: &str,
    mode: RunMode,
    input_count: usize,
    result: &BatchResult,
) -> Result<i64> {
    let (delivered, transport_failures) = match mode {
        RunMode::Preview => (0, 0),
        RunMode::Dispatch => (result.delivered(), result.transport_failures()),
    };

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        r#"
        INSERT INTO batch_runs (
          campaign, mode, input_count, rendered, delivered, transport_failures,
          skipped, failed, cancelled, not_attempted, paced_ms
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            campaign,
            mode.as_str(),
            input_count as i64,
            result.rendered.len() as i64,
            delivered as i64,
            transport_failures as i64,
            result.skipped.len() as i64,
            result.failed.len() as i64,
            result.cancelled,
            result.not_attempted as i64,
            result.paced.as_millis() as i64,
        ],
    )?;
    let run_id = tx.last_insert_rowid();

    {
        let mut insert = tx.prepare(
            r#"
            INSERT INTO batch_outcomes (
              run_id, position, representative_id, status,
              locale, tier, attendance_pct, destination, detail
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )?;
        for dispatched in &result.rendered {
            let m = &dispatched.message;
            let status = match (mode, dispatched.delivered) {
                (RunMode::Preview, _) => "previewed",
                (RunMode::Dispatch, true) => "delivered",
                (RunMode::Dispatch, false) => "transport_failed",
            };
            insert.execute(params![
                run_id,
                dispatched.index as i64,
                m.representative_id,
                status,
                m.locale.as_str(),
                m.tier,
                m.attendance_pct,
                m.destination,
                m.subject,
            ])?;
        }
        for skipped in &result.skipped {
            insert.execute(params![
                run_id,
                skipped.index as i64,
                skipped.representative_id,
                "skipped",
                None::<String>,
                None::<String>,
                None::<String>,
                None::<String>,
                skipped.reason.to_string(),
            ])?;
        }
        for failed in &result.failed {
            insert.execute(params![
                run_id,
                failed.index as i64,
                failed.representative_id,
                "failed",
                None::<String>,
                None::<String>,
                None::<String>,
                None::<String>,
                failed.cause.to_string(),
            ])?;
        }
    }

    tx.commit()?;
    Ok(run_id)
}

/// Latest report per representative wins.
pub fn upsert_reconciliation(conn: &Connection, report: &ReconciliationReport) -> Result<()> {
    let report_json = serde_json::to_string(report)?;
    let confidence = serde_json::to_value(report.confidence)?;

    conn.execute(
        r#"
        INSERT INTO reconciliations (
          representative_id, confidence, votes_total_period, votes_cast,
          evidenced, candidates, report_json
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(representative_id) DO UPDATE SET
          confidence=excluded.confidence,
          votes_total_period=excluded.votes_total_period,
          votes_cast=excluded.votes_cast,
          evidenced=excluded.evidenced,
          candidates=excluded.candidates,
          report_json=excluded.report_json,
          computed_at=strftime('%Y-%m-%dT%H:%M:%fZ','now')
        "#,
        params![
            report.representative_id,
            confidence.as_str().unwrap_or_default(),
            report.votes_total_period,
            report.votes_cast,
            report.evidenced as i64,
            report.missed_candidates.len() as i64,
            report_json,
        ],
    )?;

    Ok(())
}

pub fn load_reconciliation(
    conn: &Connection,
    representative_id: &str,
) -> Result<Option<ReconciliationReport>> {
    let json: Option<String> = conn
        .query_row(
            "SELECT report_json FROM reconciliations WHERE representative_id = ?1",
            [representative_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match json {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    })
}

pub fn enqueue(conn: &Connection, message: &OutgoingMessage) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO outbox (representative_id, destination, locale, subject, body)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            message.representative_id,
            message.destination,
            message.locale.as_str(),
            message.subject,
            message.body,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedMessage {
    pub id: i64,
    pub representative_id: String,
    pub destination: String,
    pub locale: String,
    pub subject: String,
    pub body: String,
    pub queued_at: String,
}

/// Unsent messages, oldest first.
pub fn pending_outbox(conn: &Connection) -> Result<Vec<QueuedMessage>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, representative_id, destination, locale, subject, body, queued_at
        FROM outbox
        WHERE sent_at IS NULL
        ORDER BY id ASC
        "#,
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(QueuedMessage {
            id: row.get(0)?,
            representative_id: row.get(1)?,
            destination: row.get(2)?,
            locale: row.get(3)?,
            subject: row.get(4)?,
            body: row.get(5)?,
            queued_at: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn mark_sent(conn: &Connection, id: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE outbox SET sent_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') WHERE id = ?1 AND sent_at IS NULL",
        [id],
    )?;
    Ok(changed == 1)
}

/// Queues messages for a separate mailer instead of sending them.
pub struct OutboxTransport<'c> {
    conn: &'c Connection,
}

impl<'c> OutboxTransport<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl Transport for OutboxTransport<'_> {
    fn deliver(&mut self, message: &OutgoingMessage) -> bool {
        match enqueue(self.conn, message) {
            Ok(_) => true,
            Err(err) => {
                error!(
                    "could not queue message for {}: {err:#}",
                    message.representative_id
                );
                false
            }
        }
    }
}
