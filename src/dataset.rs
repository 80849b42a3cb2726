//! Download one month of trips and turn it into feature dictionaries.
//!
//! Steps, each writing its artifact under the data root:
//! 1. download  -> `raw/`       (parquet as published)
//! 2. prepare   -> `interim/`   (duration label, bounded, zones as strings)
//! 3. features  -> `processed/` (`{PU_DO, trip_distance}` dictionaries, JSON)

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Duration;

use polars::prelude::*;
use tracing::{debug, info};

use crate::config::TransformConfig;
use crate::error::{PipelineError, Result};
use crate::features::{
    trip_features, zone_pair, FeatureDict, DROPOFF_ZONE, PICKUP_ZONE, TRIP_DISTANCE, ZONE_PAIR,
};
use crate::storage::Uploader;
use crate::trainer::Split;
use crate::window::{DataPaths, Mode, TripWindow};

pub const PICKUP_TIME: &str = "lpep_pickup_datetime";
pub const DROPOFF_TIME: &str = "lpep_dropoff_datetime";
pub const DURATION: &str = "duration";

const FEATURE_COLUMNS: &[&str] = &[PICKUP_ZONE, DROPOFF_ZONE, TRIP_DISTANCE];

pub struct Dataset {
    window: TripWindow,
    mode: Mode,
    paths: DataPaths,
    transform: TransformConfig,
    frame: Option<DataFrame>,
    features: Vec<FeatureDict>,
}

impl Dataset {
    pub fn new(
        window: TripWindow,
        mode: Mode,
        base_url: &str,
        data_root: &Path,
        transform: TransformConfig,
    ) -> Self {
        let paths = DataPaths::resolve(&window, mode, base_url, data_root);
        Self {
            window,
            mode,
            paths,
            transform,
            frame: None,
            features: Vec::new(),
        }
    }

    pub fn window(&self) -> &TripWindow {
        &self.window
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    pub fn frame(&self) -> Option<&DataFrame> {
        self.frame.as_ref()
    }

    /// Replace the working frame, e.g. with data loaded elsewhere.
    pub fn set_frame(&mut self, frame: DataFrame) {
        self.frame = Some(frame);
    }

    pub fn features(&self) -> &[FeatureDict] {
        &self.features
    }

    fn frame_mut(&mut self) -> Result<&mut DataFrame> {
        self.frame
            .as_mut()
            .ok_or_else(|| PipelineError::EmptyDataset(format!("{} has no data loaded", self.window)))
    }

    /// Fetch the monthly file into `raw/` (reusing an earlier download) and load it.
    pub fn download(&mut self, uploader: Option<&Uploader>) -> Result<()> {
        let raw = self.paths.raw.clone();
        if raw.exists() {
            info!(window = %self.window, mode = %self.mode, path = %raw.display(), "using cached download");
        } else {
            ensure_parent(&raw)?;
            info!(window = %self.window, mode = %self.mode, url = %self.paths.file_url, "downloading trip data");
            let client = reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()?;
            let bytes = client
                .get(&self.paths.file_url)
                .send()?
                .error_for_status()?
                .bytes()?;
            fs::write(&raw, &bytes)?;
            debug!(bytes = bytes.len(), path = %raw.display(), "raw file written");
        }

        let frame = read_parquet(&raw)?;
        info!(window = %self.window, rows = frame.height(), cols = frame.width(), "loaded raw trips");
        self.frame = Some(frame);

        if let Some(up) = uploader {
            up.upload(&raw, "raw");
        }
        Ok(())
    }

    /// Derive the duration label, keep trips within bounds, stringify zone ids.
    pub fn prepare(&mut self, uploader: Option<&Uploader>) -> Result<()> {
        let TransformConfig {
            min_duration,
            max_duration,
            duration_unit_secs,
        } = self.transform;
        let interim = self.paths.interim.clone();
        let window = self.window.to_string();

        let frame = self.frame_mut()?;
        let before = frame.height();
        let mut df = frame.drop_nulls(Some(FEATURE_COLUMNS))?;

        let pickup = epoch_seconds(&df, PICKUP_TIME)?;
        let dropoff = epoch_seconds(&df, DROPOFF_TIME)?;
        let durations: Vec<Option<f64>> = pickup
            .iter()
            .zip(&dropoff)
            .map(|(p, d)| match (p, d) {
                (Some(p), Some(d)) => Some((d - p) / duration_unit_secs),
                _ => None,
            })
            .collect();
        df.with_column(Series::new(DURATION, durations))?;

        let mask = {
            let duration = df.column(DURATION)?.f64()?;
            duration.gt_eq(min_duration) & duration.lt_eq(max_duration)
        };
        let mut df = df.filter(&mask)?;

        for zone in [PICKUP_ZONE, DROPOFF_ZONE] {
            let as_text = df.column(zone)?.cast(&DataType::Utf8)?;
            df.with_column(as_text)?;
        }

        info!(%window, before, after = df.height(), "prepared trips");

        ensure_parent(&interim)?;
        write_parquet(&mut df, &interim)?;
        *frame = df;

        if let Some(up) = uploader {
            up.upload(&interim, "interim");
        }
        Ok(())
    }

    /// Add the `PU_DO` key and build the feature dictionaries.
    pub fn prepare_features(&mut self, uploader: Option<&Uploader>) -> Result<()> {
        let processed = self.paths.processed.clone();
        let frame = self.frame_mut()?;

        let pairs: Utf8Chunked = {
            let pickup = frame.column(PICKUP_ZONE)?.utf8()?;
            let dropoff = frame.column(DROPOFF_ZONE)?.utf8()?;
            pickup
                .into_iter()
                .zip(dropoff.into_iter())
                .map(|(p, d)| match (p, d) {
                    (Some(p), Some(d)) => Some(zone_pair(p, d)),
                    _ => None,
                })
                .collect()
        };
        frame.with_column(pairs.with_name(ZONE_PAIR).into_series())?;

        let features = {
            let pickup = frame.column(PICKUP_ZONE)?.utf8()?;
            let dropoff = frame.column(DROPOFF_ZONE)?.utf8()?;
            let distance = frame.column(TRIP_DISTANCE)?.cast(&DataType::Float64)?;
            let distance = distance.f64()?;

            pickup
                .into_iter()
                .zip(dropoff.into_iter())
                .zip(distance.into_iter())
                .map(|((p, d), dist)| match (p, d, dist) {
                    (Some(p), Some(d), Some(dist)) => Ok(trip_features(p, d, dist)),
                    _ => Err(PipelineError::Schema(format!(
                        "null in {PICKUP_ZONE}/{DROPOFF_ZONE}/{TRIP_DISTANCE}"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?
        };

        ensure_parent(&processed)?;
        let writer = BufWriter::new(File::create(&processed)?);
        serde_json::to_writer(writer, &features)?;
        info!(records = features.len(), path = %processed.display(), "feature dictionaries written");
        self.features = features;

        if let Some(up) = uploader {
            up.upload(&processed, "processed");
        }
        Ok(())
    }

    /// Duration labels, aligned with [`Dataset::features`].
    pub fn targets(&self) -> Result<Vec<f64>> {
        let frame = self
            .frame
            .as_ref()
            .ok_or_else(|| PipelineError::EmptyDataset(format!("{} has no data loaded", self.window)))?;
        frame
            .column(DURATION)?
            .f64()?
            .into_iter()
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| PipelineError::Schema(format!("null {DURATION} value")))
    }

    /// Consume the dataset into labeled dictionaries for the trainer.
    pub fn into_split(self) -> Result<Split> {
        let targets = self.targets()?;
        Ok(Split::new(self.features, targets))
    }

    pub fn run(&mut self, uploader: Option<&Uploader>) -> Result<()> {
        self.download(uploader)?;
        self.prepare(uploader)?;
        self.prepare_features(uploader)?;
        Ok(())
    }
}

/// Read back the dictionaries written by [`Dataset::prepare_features`].
pub fn load_features(path: &Path) -> Result<Vec<FeatureDict>> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

pub fn read_parquet(path: &Path) -> Result<DataFrame> {
    let file = File::open(path)?;
    Ok(ParquetReader::new(file).finish()?)
}

pub fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    ParquetWriter::new(&mut file).finish(df)?;
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Timestamp column as fractional seconds since the epoch.
fn epoch_seconds(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = df.column(name)?;
    let ticks_per_second = match column.dtype() {
        DataType::Datetime(TimeUnit::Nanoseconds, _) => 1e9,
        DataType::Datetime(TimeUnit::Microseconds, _) => 1e6,
        DataType::Datetime(TimeUnit::Milliseconds, _) => 1e3,
        other => {
            return Err(PipelineError::Schema(format!(
                "{name} should be a timestamp, found {other}"
            )))
        }
    };
    let ticks = column.cast(&DataType::Int64)?;
    Ok(ticks
        .i64()?
        .into_iter()
        .map(|t| t.map(|t| t as f64 / ticks_per_second))
        .collect())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const MICROS: i64 = 1_000_000;

    fn timestamps(name: &str, secs: &[i64]) -> Series {
        let micros: Vec<i64> = secs.iter().map(|s| s * MICROS).collect();
        Series::new(name, micros)
            .cast(&DataType::Datetime(TimeUnit::Microseconds, None))
            .unwrap()
    }

    /// Trips lasting 10s, 20s, 600s, 1200s and 1220s.
    fn raw_frame() -> DataFrame {
        DataFrame::new(vec![
            timestamps(PICKUP_TIME, &[0, 0, 0, 0, 0]),
            timestamps(DROPOFF_TIME, &[10, 20, 600, 1200, 1220]),
            Series::new(PICKUP_ZONE, &[1i64, 2, 3, 4, 5]),
            Series::new(DROPOFF_ZONE, &[6i64, 7, 8, 9, 10]),
            Series::new(TRIP_DISTANCE, &[0.5f64, 1.5, 2.0, 3.0, 4.0]),
        ])
        .unwrap()
    }

    fn dataset(root: &Path) -> Dataset {
        Dataset::new(
            TripWindow::new("green", 2022, 1).unwrap(),
            Mode::Train,
            "http://unused.invalid/",
            root,
            TransformConfig::default(),
        )
    }

    #[test]
    fn prepare_bounds_duration() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        ds.set_frame(raw_frame());
        ds.prepare(None).unwrap();

        let durations = ds.targets().unwrap();
        assert_eq!(durations, vec![1.0, 30.0, 60.0]);
        assert!(durations.iter().all(|d| (1.0..=60.0).contains(d)));
        assert!(ds.paths().interim.exists());
    }

    #[test]
    fn prepare_stringifies_zones() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        ds.set_frame(raw_frame());
        ds.prepare(None).unwrap();

        let frame = ds.frame().unwrap();
        assert_eq!(frame.column(PICKUP_ZONE).unwrap().dtype(), &DataType::Utf8);
        assert_eq!(frame.column(DROPOFF_ZONE).unwrap().dtype(), &DataType::Utf8);
    }

    #[test]
    fn features_use_composite_key() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        ds.set_frame(raw_frame());
        ds.prepare(None).unwrap();
        ds.prepare_features(None).unwrap();

        let expected = vec![
            trip_features("2", "7", 1.5),
            trip_features("3", "8", 2.0),
            trip_features("4", "9", 3.0),
        ];
        assert_eq!(ds.features(), expected.as_slice());
        assert_eq!(ds.features().len(), ds.targets().unwrap().len());

        let pairs: Vec<Option<&str>> = ds
            .frame()
            .unwrap()
            .column(ZONE_PAIR)
            .unwrap()
            .utf8()
            .unwrap()
            .into_iter()
            .collect();
        assert_eq!(pairs, vec![Some("2_7"), Some("3_8"), Some("4_9")]);

        let reloaded = load_features(&ds.paths().processed).unwrap();
        assert_eq!(reloaded, expected);
    }

    #[test]
    fn prepare_drops_rows_with_missing_zones() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        let frame = DataFrame::new(vec![
            timestamps(PICKUP_TIME, &[0, 0]),
            timestamps(DROPOFF_TIME, &[600, 600]),
            Series::new(PICKUP_ZONE, &[Some(1i64), None]),
            Series::new(DROPOFF_ZONE, &[Some(2i64), Some(3)]),
            Series::new(TRIP_DISTANCE, &[1.0f64, 2.0]),
        ])
        .unwrap();
        ds.set_frame(frame);
        ds.prepare(None).unwrap();
        ds.prepare_features(None).unwrap();
        assert_eq!(ds.features(), &[trip_features("1", "2", 1.0)]);
    }

    #[test]
    fn non_timestamp_columns_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        let frame = DataFrame::new(vec![
            Series::new(PICKUP_TIME, &["2022-01-01"]),
            Series::new(DROPOFF_TIME, &["2022-01-01"]),
            Series::new(PICKUP_ZONE, &[1i64]),
            Series::new(DROPOFF_ZONE, &[2i64]),
            Series::new(TRIP_DISTANCE, &[1.0f64]),
        ])
        .unwrap();
        ds.set_frame(frame);
        assert!(matches!(ds.prepare(None), Err(PipelineError::Schema(_))));
    }

    #[test]
    fn steps_need_loaded_data() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        assert!(matches!(ds.prepare(None), Err(PipelineError::EmptyDataset(_))));
        assert!(ds.targets().is_err());
    }

    #[test]
    fn download_reuses_cached_raw_file() {
        let tmp = TempDir::new().unwrap();
        let mut ds = dataset(tmp.path());
        let raw = ds.paths().raw.clone();
        fs::create_dir_all(raw.parent().unwrap()).unwrap();
        write_parquet(&mut raw_frame(), &raw).unwrap();

        ds.run(None).unwrap();
        assert_eq!(ds.features().len(), 3);
        assert!(ds.paths().processed.exists());
    }
}
