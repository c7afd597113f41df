use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// `votes_cast / votes_total_period`, guaranteed finite and within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct AttendanceRatio(f64);

impl AttendanceRatio {
    /// `None` when the period had no votes or `cast` exceeds `total`.
    pub fn from_counts(cast: u32, total: u32) -> Option<Self> {
        if total == 0 || cast > total {
            return None;
        }
        Some(Self(f64::from(cast) / f64::from(total)))
    }

    pub fn from_fraction(value: f64) -> Option<Self> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }

    pub fn percent(self) -> f64 {
        self.0 * 100.0
    }
}

/// One band of a scheme: ratios `>= min` (and below the previous band) fall in `tier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Band {
    pub min: f64,
    pub tier: String,
}

/// Raw scheme as written in a campaign file, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TierSchemeSpec {
    pub bands: Vec<Band>,
    pub bottom: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TierSchemeError {
    #[error("tier names must not be empty")]
    EmptyName,
    #[error("tier `{0}` appears more than once")]
    DuplicateTier(String),
    #[error("lower bound {min} of tier `{tier}` must lie in (0, 1]")]
    BoundOutOfRange { tier: String, min: f64 },
    #[error("lower bound of tier `{tier}` must be strictly below the band before it")]
    NotDescending { tier: String },
}

/// A classified tier. `rank` 0 is the highest band; the bottom tier has the
/// largest rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier<'a> {
    pub name: &'a str,
    pub rank: usize,
}

/// Ordered attendance bands plus an implicit bottom tier.
///
/// Validation guarantees the bands partition `[0, 1]`: bounds are strictly
/// descending inside `(0, 1]`, so every ratio matches exactly one band or
/// falls through to the bottom tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "TierSchemeSpec")]
pub struct TierScheme {
    bands: Vec<Band>,
    bottom: String,
}

impl TierScheme {
    pub fn new(bands: Vec<Band>, bottom: impl Into<String>) -> Result<Self, TierSchemeError> {
        let bottom = bottom.into();
        let mut seen = HashSet::new();
        let mut previous: Option<f64> = None;

        for band in &bands {
            if band.tier.trim().is_empty() {
                return Err(TierSchemeError::EmptyName);
            }
            if !seen.insert(band.tier.as_str()) {
                return Err(TierSchemeError::DuplicateTier(band.tier.clone()));
            }
            if !band.min.is_finite() || band.min <= 0.0 || band.min > 1.0 {
                return Err(TierSchemeError::BoundOutOfRange {
                    tier: band.tier.clone(),
                    min: band.min,
                });
            }
            if previous.is_some_and(|prev| band.min >= prev) {
                return Err(TierSchemeError::NotDescending {
                    tier: band.tier.clone(),
                });
            }
            previous = Some(band.min);
        }

        if bottom.trim().is_empty() {
            return Err(TierSchemeError::EmptyName);
        }
        if seen.contains(bottom.as_str()) {
            return Err(TierSchemeError::DuplicateTier(bottom));
        }

        Ok(Self { bands, bottom })
    }

    pub fn classify(&self, ratio: AttendanceRatio) -> Tier<'_> {
        let value = ratio.value();
        match self.bands.iter().position(|band| band.min <= value) {
            Some(rank) => Tier {
                name: &self.bands[rank].tier,
                rank,
            },
            None => Tier {
                name: &self.bottom,
                rank: self.bands.len(),
            },
        }
    }

    /// Tier names from highest to lowest, bottom tier last.
    pub fn tier_names(&self) -> impl Iterator<Item = &str> {
        self.bands
            .iter()
            .map(|band| band.tier.as_str())
            .chain(std::iter::once(self.bottom.as_str()))
    }

    pub fn contains(&self, tier: &str) -> bool {
        self.tier_names().any(|name| name == tier)
    }

    pub fn bands(&self) -> &[Band] {
        &self.bands
    }

    pub fn bottom(&self) -> &str {
        &self.bottom
    }
}

impl TryFrom<TierSchemeSpec> for TierScheme {
    type Error = TierSchemeError;

    fn try_from(spec: TierSchemeSpec) -> Result<Self, Self::Error> {
        TierScheme::new(spec.bands, spec.bottom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn band(min: f64, tier: &str) -> Band {
        Band {
            min,
            tier: tier.to_string(),
        }
    }

    fn remediation() -> TierScheme {
        TierScheme::new(vec![band(0.90, "high"), band(0.70, "medium")], "low").unwrap()
    }

    fn celebratory() -> TierScheme {
        TierScheme::new(
            vec![band(0.95, "excellent"), band(0.85, "very_good")],
            "good",
        )
        .unwrap()
    }

    fn ratio(value: f64) -> AttendanceRatio {
        AttendanceRatio::from_fraction(value).unwrap()
    }

    #[test]
    fn lower_bounds_are_inclusive() {
        let scheme = remediation();
        assert_eq!(scheme.classify(ratio(0.90)).name, "high");
        assert_eq!(scheme.classify(ratio(0.8999)).name, "medium");
        assert_eq!(scheme.classify(ratio(0.70)).name, "medium");
        assert_eq!(scheme.classify(ratio(0.6999)).name, "low");
        assert_eq!(scheme.classify(ratio(0.0)).name, "low");
        assert_eq!(scheme.classify(ratio(1.0)).name, "high");
    }

    #[test]
    fn ratio_from_counts_hits_band_edges_exactly() {
        let scheme = remediation();
        let nine_of_ten = AttendanceRatio::from_counts(9, 10).unwrap();
        assert_eq!(scheme.classify(nine_of_ten).name, "high");
        let seven_of_ten = AttendanceRatio::from_counts(7, 10).unwrap();
        assert_eq!(scheme.classify(seven_of_ten).name, "medium");
    }

    #[test]
    fn ranks_follow_band_order() {
        let scheme = celebratory();
        assert_eq!(scheme.classify(ratio(0.99)).rank, 0);
        assert_eq!(scheme.classify(ratio(0.90)).rank, 1);
        assert_eq!(scheme.classify(ratio(0.80)).rank, 2);
        assert_eq!(
            scheme.tier_names().collect::<Vec<_>>(),
            vec!["excellent", "very_good", "good"]
        );
    }

    #[test]
    fn a_scheme_without_bands_puts_everything_in_the_bottom_tier() {
        let scheme = TierScheme::new(Vec::new(), "everyone").unwrap();
        assert_eq!(scheme.classify(ratio(1.0)).name, "everyone");
        assert_eq!(scheme.classify(ratio(0.0)).name, "everyone");
    }

    #[test]
    fn invalid_schemes_are_rejected() {
        assert_eq!(
            TierScheme::new(vec![band(0.7, "medium"), band(0.9, "high")], "low"),
            Err(TierSchemeError::NotDescending {
                tier: "high".to_string()
            })
        );
        assert_eq!(
            TierScheme::new(vec![band(0.9, "high"), band(0.9, "also_high")], "low"),
            Err(TierSchemeError::NotDescending {
                tier: "also_high".to_string()
            })
        );
        assert_eq!(
            TierScheme::new(vec![band(0.9, "high"), band(0.7, "high")], "low"),
            Err(TierSchemeError::DuplicateTier("high".to_string()))
        );
        assert_eq!(
            TierScheme::new(vec![band(0.9, "high")], "high"),
            Err(TierSchemeError::DuplicateTier("high".to_string()))
        );
        assert!(matches!(
            TierScheme::new(vec![band(0.0, "all")], "none"),
            Err(TierSchemeError::BoundOutOfRange { .. })
        ));
        assert!(matches!(
            TierScheme::new(vec![band(1.5, "over")], "rest"),
            Err(TierSchemeError::BoundOutOfRange { .. })
        ));
        assert!(matches!(
            TierScheme::new(vec![band(f64::NAN, "nan")], "rest"),
            Err(TierSchemeError::BoundOutOfRange { .. })
        ));
        assert_eq!(
            TierScheme::new(vec![band(0.5, " ")], "rest"),
            Err(TierSchemeError::EmptyName)
        );
    }

    #[test]
    fn fractions_outside_the_unit_interval_are_not_ratios() {
        assert!(AttendanceRatio::from_fraction(-0.01).is_none());
        assert!(AttendanceRatio::from_fraction(1.01).is_none());
        assert!(AttendanceRatio::from_fraction(f64::NAN).is_none());
        assert!(AttendanceRatio::from_fraction(f64::INFINITY).is_none());
        assert!(AttendanceRatio::from_counts(5, 0).is_none());
        assert!(AttendanceRatio::from_counts(0, 0).is_none());
        assert!(AttendanceRatio::from_counts(11, 10).is_none());
    }

    #[test]
    fn scheme_deserializes_through_validation() {
        let scheme: TierScheme = toml::from_str(
            r#"
            bottom = "low"
            [[bands]]
            min = 0.9
            tier = "high"
            "#,
        )
        .unwrap();
        assert_eq!(scheme.bottom(), "low");
        assert_eq!(scheme.bands().len(), 1);

        let invalid: Result<TierScheme, _> = toml::from_str(
            r#"
            bottom = "high"
            [[bands]]
            min = 0.9
            tier = "high"
            "#,
        );
        assert!(invalid.is_err());
    }

    proptest! {
        #[test]
        fn every_ratio_lands_in_exactly_one_band(value in 0.0f64..=1.0) {
            for scheme in [remediation(), celebratory()] {
                let tier = scheme.classify(ratio(value));
                let matching: Vec<&str> = scheme
                    .tier_names()
                    .enumerate()
                    .filter(|(rank, _)| {
                        let lower = scheme.bands().get(*rank).map_or(0.0, |b| b.min);
                        let upper = if *rank == 0 { f64::INFINITY } else { scheme.bands()[*rank - 1].min };
                        lower <= value && value < upper
                    })
                    .map(|(_, name)| name)
                    .collect();
                prop_assert_eq!(matching, vec![tier.name]);
            }
        }

        #[test]
        fn classification_is_monotonic(a in 0.0f64..=1.0, b in 0.0f64..=1.0) {
            let scheme = remediation();
            let (low, high) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(scheme.classify(ratio(high)).rank <= scheme.classify(ratio(low)).rank);
        }
    }
}
