//! The latest known fuel prices.
//!
//! The upstream feed is a weekly CSV where every row is tagged either
//! `level` (the price that week) or `change` (the difference to the week
//! before). Only the newest row of each kind is kept.

use std::future::Future;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BotError;

/// Days a level row stays current before the feed is fetched again.
pub const REFRESH_AFTER_DAYS: i64 = 6;
pub const DATE_FORMAT: &str = "%d/%m/%Y";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub date: NaiveDate,
    pub ron95: f64,
    pub ron97: f64,
    pub diesel: f64,
}

impl Row {
    pub fn new(date: NaiveDate, ron95: f64, ron97: f64, diesel: f64) -> Self {
        Self {
            date,
            ron95,
            ron97,
            diesel,
        }
    }

    fn sentinel() -> Self {
        Self::new(NaiveDate::MIN, 0.0, 0.0, 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeriesRow {
    Level(Row),
    Change(Row),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestSnapshot {
    pub level: Row,
    pub change: Row,
}

impl Default for LatestSnapshot {
    fn default() -> Self {
        Self {
            level: Row::sentinel(),
            change: Row::sentinel(),
        }
    }
}

impl LatestSnapshot {
    /// Folds one row in. A row only replaces the held row of the same kind
    /// when its date is strictly newer.
    pub fn merge(self, incoming: &SeriesRow) -> Self {
        match incoming {
            SeriesRow::Level(row) if row.date > self.level.date => Self {
                level: *row,
                ..self
            },
            SeriesRow::Change(row) if row.date > self.change.date => Self {
                change: *row,
                ..self
            },
            _ => self,
        }
    }

    pub fn merge_all<'a>(self, rows: impl IntoIterator<Item = &'a SeriesRow>) -> Self {
        rows.into_iter().fold(self, |current, row| current.merge(row))
    }

    /// False until a level row has been merged.
    pub fn is_populated(&self) -> bool {
        self.level.date > NaiveDate::MIN
    }

    /// True once the held level row is more than six days old at `now`.
    pub fn is_stale(&self, now: NaiveDateTime) -> bool {
        let held = self.level.date.and_time(NaiveTime::MIN);
        match held.checked_add_signed(TimeDelta::days(REFRESH_AFTER_DAYS)) {
            Some(expires) => expires < now,
            None => false,
        }
    }

    /// Calls `fetch` only when the snapshot is stale and folds every fetched
    /// row in. A failed fetch leaves nothing merged: the error is returned
    /// and the caller keeps its current value.
    pub async fn refresh_if_stale<F, Fut>(
        &self,
        now: NaiveDateTime,
        fetch: F,
    ) -> Result<LatestSnapshot, BotError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<SeriesRow>, BotError>>,
    {
        if !self.is_stale(now) {
            debug!(level_date = %self.level.date, "fuel price snapshot is current");
            return Ok(*self);
        }

        let rows = fetch().await?;
        let updated = self.merge_all(&rows);
        info!(
            rows = rows.len(),
            level_date = %updated.level.date,
            change_date = %updated.change.date,
            "fuel price snapshot refreshed"
        );
        Ok(updated)
    }

    /// The weekly comparison text shown to users.
    pub fn describe(&self, source_url: &str) -> String {
        let until = self
            .level
            .date
            .checked_add_signed(TimeDelta::days(REFRESH_AFTER_DAYS))
            .unwrap_or(self.level.date);

        let mut sections = vec![
            format!("Data sourced from {source_url}"),
            format!(
                "From {} to {}",
                self.level.date.format(DATE_FORMAT),
                until.format(DATE_FORMAT)
            ),
        ];
        for (label, level, change) in [
            ("RON 95", self.level.ron95, self.change.ron95),
            ("RON 97", self.level.ron97, self.change.ron97),
            ("diesel", self.level.diesel, self.change.diesel),
        ] {
            sections.push(format!(
                "Price of {label} is RM {level} per litre ({change:+.2} from last week)"
            ));
        }
        sections.join("\n\n")
    }
}

#[derive(Debug, Deserialize)]
struct FuelRecord {
    series_type: String,
    date: NaiveDate,
    ron95: Option<f64>,
    ron97: Option<f64>,
    diesel: Option<f64>,
}

/// Parses the fuel price CSV. Rows of an unknown series type or with empty
/// price columns are skipped; a malformed row fails the whole batch.
pub fn parse_fuel_csv(text: &str) -> Result<Vec<SeriesRow>, BotError> {
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let mut rows = Vec::new();

    for record in reader.deserialize::<FuelRecord>() {
        let record = record.map_err(|e| BotError::upstream("fuel price csv", e))?;
        let (Some(ron95), Some(ron97), Some(diesel)) = (record.ron95, record.ron97, record.diesel)
        else {
            debug!(date = %record.date, "skipping fuel price row with empty columns");
            continue;
        };
        let row = Row::new(record.date, ron95, ron97, diesel);
        match record.series_type.as_str() {
            "level" => rows.push(SeriesRow::Level(row)),
            "change" => rows.push(SeriesRow::Change(row)),
            other => debug!(series_type = other, "skipping unknown fuel price series"),
        }
    }
    Ok(rows)
}
