//! Day-boundary rollover.

use chrono::{DateTime, Local, NaiveDate, Utc};
use quill_ledger::local_day;

/// Whether a ledger last touched at `latest` belongs to a day before `today`.
///
/// A ledger with no activity never needs rolling over.
pub fn needs_rollover(latest: Option<DateTime<Utc>>, today: NaiveDate) -> bool {
    latest.is_some_and(|at| local_day(at) < today)
}

/// Today's date on the local clock.
pub fn local_today() -> NaiveDate {
    Local::now().date_naive()
}
