//! Feature dictionaries and the vectorizer that turns them into a sparse matrix.
//!
//! String-valued features are one-hot encoded as `name=value` columns, numeric
//! features keep their value under their own name. Columns are ordered by
//! name so a fitted vocabulary is stable across runs.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PipelineError, Result};

pub const PICKUP_ZONE: &str = "PULocationID";
pub const DROPOFF_ZONE: &str = "DOLocationID";
pub const TRIP_DISTANCE: &str = "trip_distance";
pub const ZONE_PAIR: &str = "PU_DO";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Num(f64),
    Str(String),
}

impl From<f64> for FeatureValue {
    fn from(v: f64) -> Self {
        FeatureValue::Num(v)
    }
}

impl From<String> for FeatureValue {
    fn from(v: String) -> Self {
        FeatureValue::Str(v)
    }
}

impl From<&str> for FeatureValue {
    fn from(v: &str) -> Self {
        FeatureValue::Str(v.to_string())
    }
}

/// One model input record.
pub type FeatureDict = BTreeMap<String, FeatureValue>;

/// Composite pickup/dropoff key.
pub fn zone_pair(pickup: &str, dropoff: &str) -> String {
    format!("{pickup}_{dropoff}")
}

/// The feature dictionary for one trip.
pub fn trip_features(pickup: &str, dropoff: &str, distance: f64) -> FeatureDict {
    let mut dict = FeatureDict::new();
    dict.insert(ZONE_PAIR.to_string(), zone_pair(pickup, dropoff).into());
    dict.insert(TRIP_DISTANCE.to_string(), distance.into());
    dict
}

/// A prediction request as posted to `/predict`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ride {
    #[serde(rename = "PULocationID")]
    pub pickup_zone: i64,
    #[serde(rename = "DOLocationID")]
    pub dropoff_zone: i64,
    pub trip_distance: f64,
}

impl Ride {
    pub fn features(&self) -> FeatureDict {
        trip_features(
            &self.pickup_zone.to_string(),
            &self.dropoff_zone.to_string(),
            self.trip_distance,
        )
    }
}

/// Zone ids arrive as JSON integers or strings; both key the same way.
fn zone_id(body: &Value, field: &str) -> Result<String> {
    match body.get(field) {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(other) => Err(PipelineError::Schema(format!(
            "{field} must be an integer or a string, got {other}"
        ))),
        None => Err(PipelineError::Schema(format!("missing {field}"))),
    }
}

/// Features for a raw `/predict` body. Fields other than the zone ids and
/// the distance are ignored.
pub fn ride_features(body: &Value) -> Result<FeatureDict> {
    let pickup = zone_id(body, PICKUP_ZONE)?;
    let dropoff = zone_id(body, DROPOFF_ZONE)?;
    let distance = body
        .get(TRIP_DISTANCE)
        .and_then(Value::as_f64)
        .ok_or_else(|| PipelineError::Schema(format!("{TRIP_DISTANCE} must be a number")))?;
    Ok(trip_features(&pickup, &dropoff, distance))
}

fn column_name(key: &str, value: &FeatureValue) -> String {
    match value {
        FeatureValue::Num(_) => key.to_string(),
        FeatureValue::Str(s) => format!("{key}={s}"),
    }
}

fn column_value(value: &FeatureValue) -> f32 {
    match value {
        FeatureValue::Num(v) => *v as f32,
        FeatureValue::Str(_) => 1.0,
    }
}

/// Compressed sparse row matrix, the layout the booster consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    pub indptr: Vec<usize>,
    pub indices: Vec<usize>,
    pub data: Vec<f32>,
    pub n_cols: usize,
}

impl SparseMatrix {
    pub fn n_rows(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    /// Dense copy of one row, mostly useful in tests and debugging.
    pub fn row_dense(&self, row: usize) -> Vec<f32> {
        let mut out = vec![0.0; self.n_cols];
        for k in self.indptr[row]..self.indptr[row + 1] {
            out[self.indices[k]] = self.data[k];
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DictVectorizer {
    vocabulary: BTreeMap<String, usize>,
}

impl DictVectorizer {
    pub fn fit(dicts: &[FeatureDict]) -> Self {
        let names: BTreeSet<String> = dicts
            .iter()
            .flat_map(|d| d.iter().map(|(k, v)| column_name(k, v)))
            .collect();

        let vocabulary = names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| (name, idx))
            .collect();

        Self { vocabulary }
    }

    pub fn len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocabulary.is_empty()
    }

    /// Column names in column order.
    pub fn feature_names(&self) -> Vec<&str> {
        let mut names: Vec<(&str, usize)> = self
            .vocabulary
            .iter()
            .map(|(name, idx)| (name.as_str(), *idx))
            .collect();
        names.sort_by_key(|(_, idx)| *idx);
        names.into_iter().map(|(name, _)| name).collect()
    }

    /// Encode `dicts`; features not seen during `fit` are dropped.
    pub fn transform(&self, dicts: &[FeatureDict]) -> SparseMatrix {
        let mut indptr = Vec::with_capacity(dicts.len() + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);

        for dict in dicts {
            let mut row: Vec<(usize, f32)> = dict
                .iter()
                .filter_map(|(k, v)| {
                    self.vocabulary
                        .get(&column_name(k, v))
                        .map(|idx| (*idx, column_value(v)))
                })
                .collect();
            row.sort_by_key(|(idx, _)| *idx);

            for (idx, value) in row {
                indices.push(idx);
                data.push(value);
            }
            indptr.push(indices.len());
        }

        SparseMatrix {
            indptr,
            indices,
            data,
            n_cols: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_pair_joins_with_underscore() {
        assert_eq!(zone_pair("9", "70"), "9_70");
        let dict = trip_features("1", "4", 1.5);
        assert_eq!(dict[ZONE_PAIR], FeatureValue::Str("1_4".into()));
        assert_eq!(dict[TRIP_DISTANCE], FeatureValue::Num(1.5));
    }

    #[test]
    fn ride_maps_to_trip_features() {
        let ride: Ride =
            serde_json::from_str(r#"{"PULocationID": 9, "DOLocationID": 70, "trip_distance": 20}"#)
                .unwrap();
        assert_eq!(ride.features(), trip_features("9", "70", 20.0));
    }

    #[test]
    fn raw_bodies_accept_integer_or_string_zones() {
        let typed = Ride {
            pickup_zone: 9,
            dropoff_zone: 70,
            trip_distance: 20.0,
        };
        let ints = serde_json::json!({"PULocationID": 9, "DOLocationID": 70, "trip_distance": 20, "VendorID": 2});
        let strs = serde_json::json!({"PULocationID": "9", "DOLocationID": "70", "trip_distance": 20.0});
        assert_eq!(ride_features(&ints).unwrap(), typed.features());
        assert_eq!(ride_features(&strs).unwrap(), typed.features());
    }

    #[test]
    fn raw_bodies_missing_fields_are_schema_errors() {
        let cases = [
            serde_json::json!({"DOLocationID": 70, "trip_distance": 1}),
            serde_json::json!({"PULocationID": 9.5, "DOLocationID": 70, "trip_distance": 1}),
            serde_json::json!({"PULocationID": 9, "DOLocationID": 70, "trip_distance": "far"}),
            serde_json::json!([1, 2, 3]),
        ];
        for body in &cases {
            assert!(
                matches!(ride_features(body), Err(PipelineError::Schema(_))),
                "accepted {body}"
            );
        }
    }

    #[test]
    fn fit_orders_columns_by_name() {
        let dicts = vec![
            trip_features("2", "5", 2.0),
            trip_features("1", "4", 1.5),
            trip_features("2", "5", 3.0),
        ];
        let vec = DictVectorizer::fit(&dicts);
        assert_eq!(
            vec.feature_names(),
            vec!["PU_DO=1_4", "PU_DO=2_5", "trip_distance"]
        );
    }

    #[test]
    fn transform_one_hot_encodes_strings() {
        let dicts = vec![trip_features("1", "4", 1.5), trip_features("2", "5", 2.0)];
        let vec = DictVectorizer::fit(&dicts);
        let m = vec.transform(&dicts);

        assert_eq!(m.n_rows(), 2);
        assert_eq!(m.n_cols, 3);
        assert_eq!(m.row_dense(0), vec![1.0, 0.0, 1.5]);
        assert_eq!(m.row_dense(1), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn unseen_categories_are_dropped() {
        let vec = DictVectorizer::fit(&[trip_features("1", "4", 1.5)]);
        let m = vec.transform(&[trip_features("9", "70", 20.0)]);
        assert_eq!(m.row_dense(0), vec![0.0, 20.0]);
        assert_eq!(m.indices, vec![1]);
    }

    #[test]
    fn feature_dicts_serialize_as_plain_objects() {
        let dict = trip_features("1", "4", 1.5);
        let json = serde_json::to_string(&dict).unwrap();
        assert_eq!(json, r#"{"PU_DO":"1_4","trip_distance":1.5}"#);
        let back: FeatureDict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dict);
    }
}
