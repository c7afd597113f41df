//! Which votes did a representative miss?
//!
//! The aggregate counts say how many votes were missed; the participation
//! records say which votes were attended, but curated exports only keep a
//! subset of them. Set difference against the full vote catalog therefore
//! yields the exact missed set only when the evidence covers every vote cast.
//! Otherwise the result is an upper bound and is reported as such. A catalog
//! wider than the representative's period (a global catalog for someone who
//! sat only part of the term) also yields an upper bound.

use log::{debug, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};

use crate::schema::{ParticipationRecord, Representative, VoteRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DataError {
    #[error("representative has no identifier")]
    MissingId,
    #[error("representative {0} is missing vote counts")]
    MissingCounts(String),
    #[error("votes cast ({cast}) exceed votes in period ({total})")]
    CastExceedsTotal { cast: u32, total: u32 },
    #[error("vote {0} appears more than once in the catalog")]
    DuplicateVote(String),
    #[error("vote {vote_id} has an unreadable timestamp {value:?}")]
    InvalidTimestamp { vote_id: String, value: String },
    #[error("participation of {representative_id} refers to vote {vote_id}, which is not in the catalog")]
    UnknownVote {
        representative_id: String,
        vote_id: String,
    },
    #[error("{evidenced} votes are evidenced as attended but only {cast} were cast")]
    EvidenceExceedsCast { evidenced: usize, cast: u32 },
    #[error("catalog holds {catalog} votes but the period has {total}")]
    CatalogTooSmall { catalog: usize, total: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Every vote cast is evidenced and the catalog covers exactly the
    /// period; the candidates are exactly the missed votes.
    Exact,
    /// Some votes cast are not evidenced, or the catalog is wider than the
    /// period; the candidates over-approximate.
    Partial,
}

/// Where a candidate sits relative to the evidenced votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    BeforeFirstEvidence,
    AfterLastEvidence,
    Interior,
    /// No evidence at all to anchor against.
    Unanchored,
}

impl Placement {
    fn rank(self) -> u8 {
        match self {
            Placement::BeforeFirstEvidence | Placement::AfterLastEvidence => 0,
            Placement::Interior => 1,
            Placement::Unanchored => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MissedCandidate {
    pub vote: VoteRecord,
    pub placement: Placement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReconciliationReport {
    pub representative_id: String,
    pub votes_total_period: u32,
    pub votes_cast: u32,
    /// Distinct catalog votes with participation evidence.
    pub evidenced: usize,
    /// `votes_total_period - votes_cast`.
    pub expected_missed: u32,
    /// `votes_cast - evidenced`: how many candidates were in fact attended.
    pub unevidenced_attendance: u32,
    pub confidence: Confidence,
    /// Catalog order (timestamp, then id).
    pub missed_candidates: Vec<MissedCandidate>,
}

impl ReconciliationReport {
    pub fn is_exact(&self) -> bool {
        self.confidence == Confidence::Exact
    }

    /// Candidates outside the evidenced time span first, then interior gaps,
    /// chronological within each group. A reading aid for partial results;
    /// it does not change their confidence.
    pub fn ranked_candidates(&self) -> Vec<&MissedCandidate> {
        let mut ranked: Vec<&MissedCandidate> = self.missed_candidates.iter().collect();
        ranked.sort_by_key(|candidate| candidate.placement.rank());
        ranked
    }
}

/// Parses the timestamp formats seen in vote exports. Offset-less values are UTC.
pub fn parse_timestamp(value: &str) -> Option<OffsetDateTime> {
    let value = value.trim();
    if let Ok(ts) = OffsetDateTime::parse(value, &Rfc3339) {
        return Some(ts);
    }
    let spaced = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    let t_separated = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    for format in [spaced, t_separated] {
        if let Ok(ts) = PrimitiveDateTime::parse(value, format) {
            return Some(ts.assume_utc());
        }
    }
    Date::parse(value, format_description!("[year]-[month]-[day]"))
        .ok()
        .map(|date| date.midnight().assume_utc())
}

pub fn reconcile(
    representative: &Representative,
    catalog: &[VoteRecord],
    participation: &[ParticipationRecord],
) -> Result<ReconciliationReport, DataError> {
    let id = representative
        .id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or(DataError::MissingId)?;
    let (cast, total) = representative
        .counts()
        .ok_or_else(|| DataError::MissingCounts(id.to_string()))?;
    if cast > total {
        return Err(DataError::CastExceedsTotal { cast, total });
    }

    let ordered = order_catalog(catalog)?;
    if ordered.len() < total as usize {
        return Err(DataError::CatalogTooSmall {
            catalog: ordered.len(),
            total,
        });
    }
    let catalog_len = ordered.len();

    let known: HashSet<&str> = ordered.iter().map(|(_, vote)| vote.id.as_str()).collect();
    if let Some(dangling) = participation
        .iter()
        .find(|record| !known.contains(record.vote_id.as_str()))
    {
        return Err(DataError::UnknownVote {
            representative_id: dangling.representative_id.clone(),
            vote_id: dangling.vote_id.clone(),
        });
    }

    let evidenced_ids: HashSet<&str> = participation
        .iter()
        .filter(|record| record.representative_id == id)
        .map(|record| record.vote_id.as_str())
        .collect();
    let evidenced = evidenced_ids.len();
    if evidenced > cast as usize {
        return Err(DataError::EvidenceExceedsCast { evidenced, cast });
    }

    let confidence = if evidenced == cast as usize && catalog_len == total as usize {
        Confidence::Exact
    } else {
        Confidence::Partial
    };

    let evidence_times: Vec<OffsetDateTime> = ordered
        .iter()
        .filter(|(_, vote)| evidenced_ids.contains(vote.id.as_str()))
        .map(|(ts, _)| *ts)
        .collect();
    let span = evidence_times.first().zip(evidence_times.last());

    let missed_candidates: Vec<MissedCandidate> = ordered
        .into_iter()
        .filter(|(_, vote)| !evidenced_ids.contains(vote.id.as_str()))
        .map(|(ts, vote)| MissedCandidate {
            vote: vote.clone(),
            placement: match span {
                None => Placement::Unanchored,
                Some((first, _)) if ts < *first => Placement::BeforeFirstEvidence,
                Some((_, last)) if ts > *last => Placement::AfterLastEvidence,
                Some(_) => Placement::Interior,
            },
        })
        .collect();

    let report = ReconciliationReport {
        representative_id: id.to_string(),
        votes_total_period: total,
        votes_cast: cast,
        evidenced,
        expected_missed: total - cast,
        unevidenced_attendance: cast - evidenced as u32,
        confidence,
        missed_candidates,
    };

    match report.confidence {
        Confidence::Exact => debug!(
            "{id}: exact, {} missed votes identified",
            report.missed_candidates.len()
        ),
        Confidence::Partial => warn!(
            "{id}: partial evidence ({evidenced} of {cast} votes cast, catalog {catalog_len} for a period of {total}), \
             {} candidates for {} missed votes",
            report.missed_candidates.len(),
            report.expected_missed
        ),
    }
    Ok(report)
}

fn order_catalog(catalog: &[VoteRecord]) -> Result<Vec<(OffsetDateTime, &VoteRecord)>, DataError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(catalog.len());
    let mut ordered = Vec::with_capacity(catalog.len());
    for vote in catalog {
        if !seen.insert(vote.id.as_str()) {
            return Err(DataError::DuplicateVote(vote.id.clone()));
        }
        let ts = parse_timestamp(&vote.timestamp).ok_or_else(|| DataError::InvalidTimestamp {
            vote_id: vote.id.clone(),
            value: vote.timestamp.clone(),
        })?;
        ordered.push((ts, vote));
    }
    ordered.sort_by(|(a_ts, a), (b_ts, b)| a_ts.cmp(b_ts).then_with(|| a.id.cmp(&b.id)));
    Ok(ordered)
}
