//! Campaign dispatch: classify, render and hand each message to a transport,
//! one representative at a time.
//!
//! A batch never aborts on a bad record. Missing data is a skip, a failed
//! lookup or render is a recorded failure, and a transport that reports
//! `false` is only tallied. The runner waits one pacing interval after every
//! representative it actually processes, so throughput stays at one message
//! per interval whatever the transport's latency.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::catalog::{CatalogError, Pattern, TemplateCatalog};
use crate::locale::{Locale, LocaleResolver};
use crate::render::{MessageRenderer, RenderError};
use crate::schema::Representative;
use crate::tiers::{AttendanceRatio, TierScheme};

/// Delivery collaborator. Returns whether the message was accepted.
pub trait Transport {
    fn deliver(&mut self, message: &OutgoingMessage) -> bool;
}

impl<F> Transport for F
where
    F: FnMut(&OutgoingMessage) -> bool,
{
    fn deliver(&mut self, message: &OutgoingMessage) -> bool {
        self(message)
    }
}

/// The runner's only suspension point.
pub trait Pacer {
    fn pause(&mut self, interval: Duration);
}

impl<F> Pacer for F
where
    F: FnMut(Duration),
{
    fn pause(&mut self, interval: Duration) {
        self(interval)
    }
}

/// Blocks the calling thread for the whole interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct SleepPacer;

impl Pacer for SleepPacer {
    fn pause(&mut self, interval: Duration) {
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
}

/// Cooperative stop signal, checked before each representative.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub trait Eligibility {
    fn admits(&self, representative: &Representative, ratio: AttendanceRatio) -> bool;
}

impl<F> Eligibility for F
where
    F: Fn(&Representative, AttendanceRatio) -> bool,
{
    fn admits(&self, representative: &Representative, ratio: AttendanceRatio) -> bool {
        self(representative, ratio)
    }
}

/// Admits representatives whose attendance is at least `min_attendance`
/// (a fraction, e.g. `0.85`). With no cutoff everyone is admitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AttendanceCutoff {
    pub min_attendance: Option<f64>,
}

impl Eligibility for AttendanceCutoff {
    fn admits(&self, _representative: &Representative, ratio: AttendanceRatio) -> bool {
        self.min_attendance.is_none_or(|min| ratio.value() >= min)
    }
}

/// Where a message goes: the record's own address, else an address derived
/// from the representative id.
#[derive(Debug, Clone, Default)]
pub struct Addressing {
    fallback: Option<Pattern>,
}

impl Addressing {
    pub fn new(fallback: Option<Pattern>) -> Self {
        Self { fallback }
    }

    pub fn destination(&self, representative: &Representative) -> Option<String> {
        if let Some(email) = representative
            .email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
        {
            return Some(email.to_string());
        }
        let id = representative.id.as_deref()?;
        let bindings = BTreeMap::from([("id", id.to_string())]);
        self.fallback.as_ref()?.render(&bindings).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutgoingMessage {
    pub representative_id: String,
    pub destination: String,
    pub locale: Locale,
    pub tier: String,
    pub attendance_pct: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub index: usize,
    pub message: OutgoingMessage,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    MissingId,
    MissingCounts,
    NoVotesInPeriod,
    Ineligible { attendance_pct: f64 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MissingId => write!(f, "missing identifier"),
            SkipReason::MissingCounts => write!(f, "missing vote counts"),
            SkipReason::NoVotesInPeriod => write!(f, "no votes in period"),
            SkipReason::Ineligible { attendance_pct } => {
                write!(f, "not eligible at {attendance_pct:.1}% attendance")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Skipped {
    pub index: usize,
    pub representative_id: Option<String>,
    pub label: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureCause {
    #[error("votes cast ({cast}) exceed votes in period ({total})")]
    InvalidCounts { cast: u32, total: u32 },
    #[error("no destination address")]
    MissingDestination,
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Render(#[from] RenderError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failed {
    pub index: usize,
    pub representative_id: String,
    pub cause: FailureCause,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    pub rendered: Vec<Dispatched>,
    pub skipped: Vec<Skipped>,
    pub failed: Vec<Failed>,
    pub cancelled: bool,
    pub not_attempted: usize,
    pub paced: Duration,
}

impl BatchResult {
    pub fn delivered(&self) -> usize {
        self.rendered.iter().filter(|d| d.delivered).count()
    }

    pub fn transport_failures(&self) -> usize {
        self.rendered.iter().filter(|d| !d.delivered).count()
    }

    pub fn processed(&self) -> usize {
        self.rendered.len() + self.failed.len()
    }
}

enum Outcome {
    Rendered(Dispatched),
    Skipped(Skipped),
    Failed(Failed),
}

pub struct BatchRunner<'a> {
    resolver: &'a LocaleResolver,
    scheme: &'a TierScheme,
    catalog: &'a TemplateCatalog,
    renderer: &'a MessageRenderer,
    addressing: &'a Addressing,
    eligibility: &'a dyn Eligibility,
    pacing: Duration,
    limit: Option<usize>,
    cancel: Option<CancelFlag>,
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        resolver: &'a LocaleResolver,
        scheme: &'a TierScheme,
        catalog: &'a TemplateCatalog,
        renderer: &'a MessageRenderer,
        addressing: &'a Addressing,
        eligibility: &'a dyn Eligibility,
        pacing: Duration,
    ) -> Self {
        Self {
            resolver,
            scheme,
            catalog,
            renderer,
            addressing,
            eligibility,
            pacing,
            limit: None,
            cancel: None,
        }
    }

    /// Processes at most `limit` records from the front of the input.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn run<T, P>(
        &self,
        representatives: &[Representative],
        transport: &mut T,
        pacer: &mut P,
    ) -> BatchResult
    where
        T: Transport + ?Sized,
        P: Pacer + ?Sized,
    {
        let representatives = match self.limit {
            Some(limit) => &representatives[..limit.min(representatives.len())],
            None => representatives,
        };
        info!(
            "processing {} representatives, pacing {:?}",
            representatives.len(),
            self.pacing
        );

        let mut result = BatchResult::default();
        for (index, representative) in representatives.iter().enumerate() {
            if self.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
                result.cancelled = true;
                result.not_attempted = representatives.len() - index;
                warn!(
                    "batch cancelled, {} representatives not attempted",
                    result.not_attempted
                );
                break;
            }

            match self.process(index, representative, transport) {
                Outcome::Skipped(skipped) => {
                    warn!("skipping {}: {}", skipped.label, skipped.reason);
                    result.skipped.push(skipped);
                    continue;
                }
                Outcome::Failed(failed) => {
                    error!("failed {}: {}", representative.label(), failed.cause);
                    result.failed.push(failed);
                }
                Outcome::Rendered(dispatched) => result.rendered.push(dispatched),
            }

            pacer.pause(self.pacing);
            result.paced += self.pacing;
        }

        info!(
            "batch done: {} rendered ({} delivered, {} transport failures), {} skipped, {} failed",
            result.rendered.len(),
            result.delivered(),
            result.transport_failures(),
            result.skipped.len(),
            result.failed.len()
        );
        result
    }

    fn process<T>(&self, index: usize, representative: &Representative, transport: &mut T) -> Outcome
    where
        T: Transport + ?Sized,
    {
        let skip = |reason| {
            Outcome::Skipped(Skipped {
                index,
                representative_id: representative.id.clone(),
                label: representative.label().to_string(),
                reason,
            })
        };

        let Some(id) = representative
            .id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            return skip(SkipReason::MissingId);
        };
        let Some((cast, total)) = representative.counts() else {
            return skip(SkipReason::MissingCounts);
        };
        if total == 0 {
            return skip(SkipReason::NoVotesInPeriod);
        }
        let fail = |cause| {
            Outcome::Failed(Failed {
                index,
                representative_id: id.to_string(),
                cause,
            })
        };
        let Some(ratio) = AttendanceRatio::from_counts(cast, total) else {
            return fail(FailureCause::InvalidCounts { cast, total });
        };
        if !self.eligibility.admits(representative, ratio) {
            return skip(SkipReason::Ineligible {
                attendance_pct: ratio.percent(),
            });
        }

        let message = match self.compose(representative, id, ratio) {
            Ok(message) => message,
            Err(cause) => return fail(cause),
        };
        debug!(
            "rendered {} message for {} ({}, tier {})",
            message.locale,
            representative.label(),
            message.destination,
            message.tier
        );

        let delivered = transport.deliver(&message);
        if !delivered {
            error!(
                "transport did not accept message for {} <{}>",
                representative.label(),
                message.destination
            );
        }
        Outcome::Rendered(Dispatched {
            index,
            message,
            delivered,
        })
    }

    fn compose(
        &self,
        representative: &Representative,
        id: &str,
        ratio: AttendanceRatio,
    ) -> Result<OutgoingMessage, FailureCause> {
        let locale = self
            .resolver
            .resolve(representative.jurisdiction.as_deref().unwrap_or_default());
        // Tiers follow the exact ratio, not the rounded percentage shown in
        // the message: 8996/10000 reads "90.0" but stays below a 0.9 bound.
        let tier = self.scheme.classify(ratio);
        let template = self.catalog.get(locale, tier.name)?;
        let remark = self.catalog.get_special_remark(tier.name, locale)?;
        let rendered = self.renderer.render(representative, template, remark)?;
        let destination = self
            .addressing
            .destination(representative)
            .ok_or(FailureCause::MissingDestination)?;

        Ok(OutgoingMessage {
            representative_id: id.to_string(),
            destination,
            locale,
            tier: tier.name.to_string(),
            attendance_pct: self.renderer.format_percent(ratio),
            subject: rendered.subject,
            body: rendered.body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Template;
    use crate::render::PLACEHOLDERS;
    use crate::tiers::Band;

    struct Fixture {
        resolver: LocaleResolver,
        scheme: TierScheme,
        catalog: TemplateCatalog,
        renderer: MessageRenderer,
        addressing: Addressing,
    }

    impl Fixture {
        fn new() -> Self {
            let scheme = TierScheme::new(
                vec![
                    Band {
                        min: 0.9,
                        tier: "high".to_string(),
                    },
                    Band {
                        min: 0.7,
                        tier: "medium".to_string(),
                    },
                ],
                "low",
            )
            .unwrap();
            let catalog = TemplateCatalog::builder(Locale::En)
                .template(
                    Locale::En,
                    None,
                    Template::parse(
                        "Attendance - {name}",
                        "Dear {name}, {votes_cast}/{total_votes} ({attendance_pct}%). {special_message}",
                    )
                    .unwrap(),
                )
                .template(
                    Locale::De,
                    None,
                    Template::parse("Anwesenheit - {name}", "{special_message}").unwrap(),
                )
                .remark("high", Locale::En, "Great.")
                .remark("medium", Locale::En, "Improve.")
                .remark("low", Locale::En, "Concerning.")
                .remark("high", Locale::De, "Toll.")
                .build(&scheme, PLACEHOLDERS)
                .unwrap();
            Self {
                resolver: LocaleResolver::with_table(Locale::En, [("Germany", Locale::De)]),
                scheme,
                catalog,
                renderer: MessageRenderer::default(),
                addressing: Addressing::new(Some(
                    Pattern::parse("mep-{id}@europarl.europa.eu").unwrap(),
                )),
            }
        }

        fn runner<'a>(&'a self, eligibility: &'a dyn Eligibility) -> BatchRunner<'a> {
            BatchRunner::new(
                &self.resolver,
                &self.scheme,
                &self.catalog,
                &self.renderer,
                &self.addressing,
                eligibility,
                Duration::from_millis(500),
            )
        }
    }

    fn rep(id: &str, name: &str, country: &str, cast: u32, total: u32) -> Representative {
        Representative {
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            jurisdiction: Some(country.to_string()),
            votes_total_period: Some(total),
            votes_cast: Some(cast),
            email: None,
        }
    }

    fn accept_all(_: &OutgoingMessage) -> bool {
        true
    }

    #[derive(Default)]
    struct RecordingPacer(Vec<Duration>);

    impl Pacer for RecordingPacer {
        fn pause(&mut self, interval: Duration) {
            self.0.push(interval);
        }
    }

    #[test]
    fn zero_vote_period_is_skipped_and_others_are_paced() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let reps = vec![
            rep("1", "Ana", "Germany", 1213, 1215),
            rep("2", "Ben", "France", 800, 1000),
            rep("3", "Cleo", "Atlantis", 0, 0),
            rep("4", "Dan", "Spain", 500, 1000),
            rep("5", "Eva", "Germany", 950, 1000),
        ];
        let mut pacer = RecordingPacer::default();
        let mut transport = accept_all;

        let result = fixture.runner(&everyone).run(&reps, &mut transport, &mut pacer);

        assert_eq!(result.rendered.len(), 4);
        assert_eq!(result.skipped.len(), 1);
        assert_eq!(result.skipped[0].reason, SkipReason::NoVotesInPeriod);
        assert_eq!(result.skipped[0].representative_id.as_deref(), Some("3"));
        assert!(result.failed.is_empty());
        assert_eq!(pacer.0.len(), 4);
        assert!(result.paced >= Duration::from_millis(500) * 4);
        assert_eq!(result.delivered(), 4);

        let tiers: Vec<&str> = result.rendered.iter().map(|d| d.message.tier.as_str()).collect();
        assert_eq!(tiers, vec!["high", "medium", "low", "high"]);
        let first = &result.rendered[0].message;
        assert_eq!(first.locale, Locale::De);
        assert_eq!(first.subject, "Anwesenheit - Ana");
        assert_eq!(first.body, "Toll.");
        assert_eq!(first.destination, "mep-1@europarl.europa.eu");
        assert_eq!(first.attendance_pct, "99.8");
    }

    #[test]
    fn tier_uses_the_exact_ratio_not_the_displayed_percentage() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let reps = vec![
            rep("1", "Ana", "Ireland", 8996, 10000),
            rep("2", "Ben", "Ireland", 9000, 10000),
        ];

        let result = fixture
            .runner(&everyone)
            .run(&reps, &mut accept_all, &mut RecordingPacer::default());

        let below = &result.rendered[0].message;
        assert_eq!(below.attendance_pct, "90.0");
        assert_eq!(below.tier, "medium");
        assert!(below.body.ends_with("Improve."));
        let at_bound = &result.rendered[1].message;
        assert_eq!(at_bound.attendance_pct, "90.0");
        assert_eq!(at_bound.tier, "high");
    }

    #[test]
    fn records_without_id_or_counts_are_skipped_in_input_order() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let mut no_id = rep("", "Nobody", "France", 5, 10);
        no_id.id = None;
        let mut blank_id = rep("  ", "Blank", "France", 5, 10);
        blank_id.email = Some("blank@example.eu".to_string());
        let mut no_counts = rep("9", "Nine", "France", 0, 0);
        no_counts.votes_cast = None;

        let result = fixture.runner(&everyone).run(
            &[no_id, blank_id, no_counts],
            &mut accept_all,
            &mut RecordingPacer::default(),
        );

        let reasons: Vec<&SkipReason> = result.skipped.iter().map(|s| &s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                &SkipReason::MissingId,
                &SkipReason::MissingId,
                &SkipReason::MissingCounts
            ]
        );
        assert_eq!(result.paced, Duration::ZERO);
    }

    #[test]
    fn cutoff_skips_low_attendance_without_failing() {
        let fixture = Fixture::new();
        let cutoff = AttendanceCutoff {
            min_attendance: Some(0.85),
        };
        let reps = vec![
            rep("1", "Ana", "France", 84, 100),
            rep("2", "Ben", "France", 85, 100),
        ];
        let result = fixture
            .runner(&cutoff)
            .run(&reps, &mut accept_all, &mut RecordingPacer::default());

        assert_eq!(result.rendered.len(), 1);
        assert_eq!(result.rendered[0].message.representative_id, "2");
        assert!(matches!(
            result.skipped[0].reason,
            SkipReason::Ineligible { attendance_pct } if (attendance_pct - 84.0).abs() < 1e-9
        ));
    }

    #[test]
    fn closures_work_as_eligibility_rules() {
        let fixture = Fixture::new();
        let germans_only = |rep: &Representative, _: AttendanceRatio| {
            rep.jurisdiction.as_deref() == Some("Germany")
        };
        let reps = vec![
            rep("1", "Ana", "Germany", 9, 10),
            rep("2", "Ben", "France", 9, 10),
        ];
        let result = fixture
            .runner(&germans_only)
            .run(&reps, &mut accept_all, &mut RecordingPacer::default());
        assert_eq!(result.rendered.len(), 1);
        assert_eq!(result.skipped.len(), 1);
    }

    #[test]
    fn render_failures_are_recorded_and_the_batch_continues() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let mut nameless = rep("1", "", "France", 9, 10);
        nameless.name = None;
        let reps = vec![
            nameless,
            rep("2", "Ben", "France", 12, 10),
            rep("3", "Cleo", "France", 9, 10),
        ];
        let mut pacer = RecordingPacer::default();

        let result = fixture.runner(&everyone).run(&reps, &mut accept_all, &mut pacer);

        assert_eq!(result.failed.len(), 2);
        assert_eq!(
            result.failed[0].cause,
            FailureCause::Render(RenderError::MissingField {
                field: "name".to_string()
            })
        );
        assert_eq!(
            result.failed[1].cause,
            FailureCause::InvalidCounts { cast: 12, total: 10 }
        );
        assert_eq!(result.rendered.len(), 1);
        assert_eq!(result.rendered[0].message.representative_id, "3");
        // Failed records are processed records and are paced too.
        assert_eq!(pacer.0.len(), 3);
    }

    #[test]
    fn transport_failures_are_tallied_not_retried() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let reps = vec![
            rep("1", "Ana", "France", 9, 10),
            rep("2", "Ben", "France", 9, 10),
            rep("3", "Cleo", "France", 9, 10),
        ];
        let mut attempts: Vec<String> = Vec::new();
        let mut flaky = |message: &OutgoingMessage| {
            attempts.push(message.representative_id.clone());
            message.representative_id != "2"
        };

        let result = fixture
            .runner(&everyone)
            .run(&reps, &mut flaky, &mut RecordingPacer::default());

        assert_eq!(attempts, vec!["1", "2", "3"]);
        assert_eq!(result.delivered(), 2);
        assert_eq!(result.transport_failures(), 1);
        assert!(result.failed.is_empty());
    }

    #[test]
    fn own_address_wins_and_missing_address_is_a_failure() {
        let mut fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let mut with_email = rep("1", "Ana", "France", 9, 10);
        with_email.email = Some(" ana@example.eu ".to_string());

        let result = fixture.runner(&everyone).run(
            &[with_email.clone()],
            &mut accept_all,
            &mut RecordingPacer::default(),
        );
        assert_eq!(result.rendered[0].message.destination, "ana@example.eu");

        fixture.addressing = Addressing::new(None);
        let result = fixture.runner(&everyone).run(
            &[with_email, rep("2", "Ben", "France", 9, 10)],
            &mut accept_all,
            &mut RecordingPacer::default(),
        );
        assert_eq!(result.rendered.len(), 1);
        assert_eq!(result.failed[0].cause, FailureCause::MissingDestination);
    }

    #[test]
    fn cancellation_stops_between_representatives() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let cancel = CancelFlag::new();
        let reps: Vec<Representative> = (1..=5)
            .map(|i| rep(&i.to_string(), "Rep", "France", 9, 10))
            .collect();
        let trigger = cancel.clone();
        let mut cancel_after_two = |message: &OutgoingMessage| {
            if message.representative_id == "2" {
                trigger.cancel();
            }
            true
        };

        let result = fixture
            .runner(&everyone)
            .with_cancel(cancel.clone())
            .run(&reps, &mut cancel_after_two, &mut RecordingPacer::default());

        assert!(result.cancelled);
        assert_eq!(result.rendered.len(), 2);
        assert_eq!(result.not_attempted, 3);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn limit_caps_the_number_of_records_processed() {
        let fixture = Fixture::new();
        let everyone = AttendanceCutoff::default();
        let reps: Vec<Representative> = (1..=5)
            .map(|i| rep(&i.to_string(), "Rep", "France", 9, 10))
            .collect();
        let result = fixture.runner(&everyone).with_limit(Some(3)).run(
            &reps,
            &mut accept_all,
            &mut RecordingPacer::default(),
        );
        assert_eq!(result.rendered.len(), 3);
        assert!(!result.cancelled);

        let result = fixture.runner(&everyone).with_limit(Some(50)).run(
            &reps,
            &mut accept_all,
            &mut RecordingPacer::default(),
        );
        assert_eq!(result.rendered.len(), 5);
    }

    #[test]
    fn sleep_pacer_waits_at_least_the_interval() {
        let started = std::time::Instant::now();
        SleepPacer.pause(Duration::from_millis(20));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
