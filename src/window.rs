//! Calendar windows over the monthly trip files and the paths derived from them.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{Datelike, Months, NaiveDate};

use crate::error::{PipelineError, Result};

/// Which side of the train/test split a dataset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Test,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Test => "test",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One month of trips for one taxi type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripWindow {
    pub taxi_type: String,
    pub year: i32,
    pub month: u32,
}

impl TripWindow {
    pub fn new(taxi_type: impl Into<String>, year: i32, month: u32) -> Result<Self> {
        first_of_month(year, month)?;
        Ok(Self {
            taxi_type: taxi_type.into(),
            year,
            month,
        })
    }

    /// The window one calendar month earlier, used as the test split.
    pub fn previous(&self) -> Result<Self> {
        let (year, month) = previous_month(self.year, self.month)?;
        Ok(Self {
            taxi_type: self.taxi_type.clone(),
            year,
            month,
        })
    }
}

impl fmt::Display for TripWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:04}-{:02}", self.taxi_type, self.year, self.month)
    }
}

fn first_of_month(year: i32, month: u32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .ok_or_else(|| PipelineError::Window(format!("no such month: {year}-{month}")))
}

/// Calendar month preceding `(year, month)`, rolling January back to December.
pub fn previous_month(year: i32, month: u32) -> Result<(i32, u32)> {
    let first = first_of_month(year, month)?;
    let prev = first
        .checked_sub_months(Months::new(1))
        .ok_or_else(|| PipelineError::Window(format!("no month before {year}-{month}")))?;
    Ok((prev.year(), prev.month()))
}

/// Source URL and local file locations for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub file_url: String,
    pub raw: PathBuf,
    pub interim: PathBuf,
    pub processed: PathBuf,
}

impl DataPaths {
    pub fn resolve(window: &TripWindow, mode: Mode, base_url: &str, data_root: &Path) -> Self {
        let TripWindow {
            taxi_type,
            year,
            month,
        } = window;

        let file_url = format!("{base_url}{taxi_type}_tripdata_{year:04}-{month:02}.parquet");
        let stem = format!("{mode}_{taxi_type}_{year}-{month}");

        Self {
            file_url,
            raw: data_root.join("raw").join(format!("{stem}.parquet")),
            interim: data_root.join("interim").join(format!("{stem}.parquet")),
            processed: data_root.join("processed").join(format!("{stem}.json")),
        }
    }
}
