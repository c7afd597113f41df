pub mod batch;
pub mod campaign;
pub mod catalog;
pub mod db;
pub mod locale;
pub mod reconcile;
pub mod render;
pub mod schema;
pub mod tiers;

pub use batch::{BatchResult, BatchRunner, CancelFlag, OutgoingMessage, SleepPacer, Transport};
pub use campaign::{Campaign, ConfigError};
pub use locale::{Locale, LocaleResolver};
pub use reconcile::{Confidence, DataError, ReconciliationReport, reconcile};
pub use schema::{ParticipationRecord, Representative, VoteRecord};
pub use tiers::{AttendanceRatio, TierScheme};
