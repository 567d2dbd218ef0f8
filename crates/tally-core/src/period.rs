//! Period resolution: which calendar months a run must compute.
//!
//! An indicator without a sync date starts in `NoHistory`; probing the
//! source for its earliest record moves it to `Backfill`, which covers
//! everything from that month to today. An indicator with a sync date is
//! `Incremental` and resumes at the month after the last synced one.
//! Preview is not part of this state machine: it only looks at the month
//! of the latest record and never consults the sync date.

use chrono::{NaiveDate, Utc};

use crate::model::Indicator;
use crate::month::{DateRange, YearMonth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Never synced; the earliest record is not known yet.
    NoHistory,
    /// Never synced; history starts at `earliest`.
    Backfill { earliest: YearMonth },
    /// Synced up to and including the month of `last_synced`.
    Incremental { last_synced: NaiveDate },
}

impl SyncState {
    pub fn of(indicator: &Indicator) -> Self {
        match indicator.last_synced_date {
            Some(last_synced) => SyncState::Incremental { last_synced },
            None => SyncState::NoHistory,
        }
    }

    /// `NoHistory` can only be resolved after a MIN date probe.
    pub fn needs_probe(&self) -> bool {
        matches!(self, SyncState::NoHistory)
    }

    /// Transition taken once the MIN probe has answered.
    pub fn with_earliest(self, earliest: YearMonth) -> Self {
        match self {
            SyncState::NoHistory => SyncState::Backfill { earliest },
            other => other,
        }
    }
}

/// Turns sync state into concrete date ranges. "Today" is fixed at
/// construction so a run resolves against a single clock reading.
#[derive(Debug, Clone, Copy)]
pub struct PeriodResolver {
    today: NaiveDate,
}

impl Default for PeriodResolver {
    fn default() -> Self {
        Self::new(Utc::now().date_naive())
    }
}

impl PeriodResolver {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// Range for a full sync. `None` while the state still needs a probe.
    ///
    /// The range may be empty (`from > to`) when everything up to today
    /// has already been synced; that is a valid, zero-point outcome.
    pub fn resolve(&self, state: &SyncState) -> Option<DateRange> {
        match state {
            SyncState::NoHistory => None,
            SyncState::Backfill { earliest } => {
                Some(DateRange::new(earliest.first_day(), self.today))
            }
            SyncState::Incremental { last_synced } => Some(DateRange::new(
                YearMonth::of(*last_synced).next().first_day(),
                self.today,
            )),
        }
    }

    /// Range for an explicit request. `to` defaults to today and `from` to
    /// the first day of the earliest record's month; with neither a `from`
    /// nor an earliest record there is nothing to compute.
    pub fn explicit(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        earliest: Option<YearMonth>,
    ) -> Option<DateRange> {
        let to = to.unwrap_or(self.today);
        let from = from.or_else(|| earliest.map(|m| m.first_day()))?;
        Some(DateRange::new(from, to))
    }

    /// Preview covers the whole month holding the latest record.
    pub fn preview(&self, latest: YearMonth) -> DateRange {
        latest.as_range()
    }
}
