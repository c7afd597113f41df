use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tiers::AttendanceRatio;

/// One row of the attendance dataset, as delivered by the upstream loader.
///
/// Every field is optional at this boundary: exports routinely contain rows
/// with a blank id or blank counts, and deciding what to do with them is the
/// batch runner's job, not the loader's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Representative {
    #[serde(alias = "mep_id")]
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "country")]
    pub jurisdiction: Option<String>, // free text, e.g. "Kingdom of the Netherlands"
    pub votes_total_period: Option<u32>,
    pub votes_cast: Option<u32>,
    pub email: Option<String>,
}

impl Representative {
    /// `(votes_cast, votes_total_period)` when both are present.
    pub fn counts(&self) -> Option<(u32, u32)> {
        Some((self.votes_cast?, self.votes_total_period?))
    }

    /// Recomputed from the counts on every call; `None` when the counts are
    /// missing, the period has no votes, or cast exceeds total.
    pub fn attendance(&self) -> Option<AttendanceRatio> {
        let (cast, total) = self.counts()?;
        AttendanceRatio::from_counts(cast, total)
    }

    pub fn label(&self) -> &str {
        self.name
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or("<unnamed>")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VoteRecord {
    #[serde(alias = "vote_id")]
    pub id: String,
    #[serde(alias = "vote_date")]
    pub timestamp: String, // ISO-8601 date or date-time, UTC when no offset is given
    pub title: String,
    #[serde(alias = "result")]
    pub outcome: Option<String>,
    #[serde(alias = "source_url")]
    pub source_reference: Option<String>,
}

/// Evidence that a representative's position was recorded for one vote.
///
/// A set of these is not a complete voting record; curated exports only keep
/// a handful of "notable" votes per member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ParticipationRecord {
    #[serde(alias = "mep_id")]
    pub representative_id: String,
    pub vote_id: String,
    #[serde(alias = "vote_position")]
    pub position: Option<String>, // "FOR", "AGAINST", "ABSTENTION", ...
    #[serde(alias = "result")]
    pub outcome: Option<String>,
}
