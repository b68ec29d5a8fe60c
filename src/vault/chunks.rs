use anyhow::{Result, bail};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open date range `[start, end)`, stored as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "(NaiveDate, NaiveDate)", into = "(NaiveDate, NaiveDate)")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl From<(NaiveDate, NaiveDate)> for DateRange {
    fn from((start, end): (NaiveDate, NaiveDate)) -> Self {
        Self { start, end }
    }
}

impl From<DateRange> for (NaiveDate, NaiveDate) {
    fn from(range: DateRange) -> Self {
        (range.start, range.end)
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if end <= start {
            bail!("empty date range: {start} .. {end}");
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Calendar years that have at least one day in the range.
    pub fn years(&self) -> Vec<i32> {
        match self.end.pred_opt() {
            Some(last) => (self.start.year()..=last.year()).collect(),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// One calendar day of ingestion work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayTask {
    pub date: NaiveDate,
}

impl DayTask {
    pub fn year(&self) -> i32 {
        self.date.year()
    }
}

fn jan_first(year: i32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
}

/// Split `overall` into consecutive chunks. Each boundary falls on Jan 1 of
/// the chunk start's year plus `chunk_years`, so after the first chunk every
/// chunk is aligned; the last one is clipped to `overall.end`.
pub fn plan_chunks(overall: DateRange, chunk_years: u32) -> Result<Vec<DateRange>> {
    if chunk_years == 0 {
        bail!("chunk_years must be >= 1");
    }
    let step = i32::try_from(chunk_years)?;
    let mut chunks = Vec::new();
    let mut cur = overall.start;
    while cur < overall.end {
        let boundary = cur
            .year()
            .checked_add(step)
            .and_then(jan_first)
            .unwrap_or(overall.end);
        let end = boundary.min(overall.end);
        chunks.push(DateRange { start: cur, end });
        cur = end;
    }
    Ok(chunks)
}

/// One task per day in `chunk`, chronological.
pub fn daily_tasks(chunk: &DateRange) -> Vec<DayTask> {
    chunk
        .start
        .iter_days()
        .take_while(|d| *d < chunk.end)
        .map(|date| DayTask { date })
        .collect()
}
