//! Merging broadcast meta-query responses.
//!
//! Meta queries (`SHOW MEASUREMENTS`, `SHOW TAG KEYS`, ...) are answered by
//! every backend, and each answer covers only the series that backend owns.
//! The reducer unions the per-backend InfluxQL JSON envelopes back into a
//! single response, deduplicating either by first column value or by series
//! name depending on the statement shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors merging upstream response bodies.
#[derive(Debug, Error)]
pub enum ReduceError {
    /// A backend answered with something that is not an InfluxQL envelope.
    #[error("invalid upstream response: {0}")]
    InvalidBody(#[from] serde_json::Error),
}

/// One series of an InfluxQL result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Series (measurement) name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Group-by tags, if any.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Column names.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    /// Row values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<Vec<Value>>,
}

/// One statement result of an InfluxQL response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Index of the statement within the query.
    #[serde(default)]
    pub statement_id: u32,
    /// The statement's series.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub series: Vec<Series>,
    /// A per-statement error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The InfluxQL response envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Statement results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<Statement>,
    /// A top-level error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// An envelope with a single statement holding `series`.
    pub fn from_series(series: Vec<Series>) -> Self {
        Self {
            results: vec![Statement {
                statement_id: 0,
                series,
                error: None,
            }],
            error: None,
        }
    }

    /// An error-only envelope.
    pub fn from_error(msg: impl Into<String>) -> Self {
        Self {
            results: Vec::new(),
            error: Some(msg.into()),
        }
    }
}

/// The series of the first statement of `body`, or empty when there is none.
pub fn series_from_body(body: &[u8]) -> Result<Vec<Series>, ReduceError> {
    let rsp: Response = serde_json::from_slice(body)?;
    Ok(rsp
        .results
        .into_iter()
        .next()
        .map(|s| s.series)
        .unwrap_or_default())
}

/// Union single-series responses by their rows' first column value.
///
/// The shape of `SHOW MEASUREMENTS` / `SHOW DATABASES`: one series whose
/// rows are keyed by the name in column 0. Collisions are idempotent (rows
/// with equal keys are equal); last write wins.
pub fn reduce_by_values(bodies: &[impl AsRef<[u8]>]) -> Result<Response, ReduceError> {
    let mut template: Option<Series> = None;
    let mut rows = BTreeMap::<String, Vec<Value>>::new();

    for body in bodies {
        let mut series = series_from_body(body.as_ref())?;
        if series.len() != 1 {
            continue;
        }
        let series = series.remove(0);
        for row in &series.values {
            let key = match row.first() {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => continue,
            };
            rows.insert(key, row.clone());
        }
        template = Some(series);
    }

    Ok(match template {
        Some(mut series) if !rows.is_empty() => {
            series.values = rows.into_values().collect();
            Response::from_series(vec![series])
        }
        _ => Response::from_series(Vec::new()),
    })
}

/// Union multi-series responses by series name.
///
/// The shape of `SHOW FIELD KEYS` / `SHOW TAG KEYS` / `SHOW TAG VALUES`:
/// one series per measurement. A series name collides only across replicas
/// holding the same measurement, so last write wins is cosmetically stable.
pub fn reduce_by_series(bodies: &[impl AsRef<[u8]>]) -> Result<Response, ReduceError> {
    let mut by_name = BTreeMap::<String, Series>::new();

    for body in bodies {
        for series in series_from_body(body.as_ref())? {
            by_name.insert(series.name.clone(), series);
        }
    }

    Ok(Response::from_series(by_name.into_values().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn measurements_body(names: &[&str]) -> Vec<u8> {
        let rsp = if names.is_empty() {
            json!({"results": [{"statement_id": 0}]})
        } else {
            json!({"results": [{"statement_id": 0, "series": [{
                "name": "measurements",
                "columns": ["name"],
                "values": names.iter().map(|n| vec![*n]).collect::<Vec<_>>(),
            }]}]})
        };
        serde_json::to_vec(&rsp).unwrap()
    }

    #[test]
    fn union_by_values_deduplicates() {
        let bodies = vec![
            measurements_body(&["cpu", "mem"]),
            measurements_body(&["cpu", "disk"]),
            measurements_body(&[]),
        ];

        let got = reduce_by_values(&bodies).unwrap();
        assert_eq!(got.results.len(), 1);

        let series = &got.results[0].series;
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].name, "measurements");

        let mut names = series[0]
            .values
            .iter()
            .map(|row| row[0].as_str().unwrap().to_owned())
            .collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, ["cpu", "disk", "mem"]);
    }

    #[test]
    fn union_by_values_of_nothing_is_empty() {
        let bodies = vec![measurements_body(&[]), measurements_body(&[])];
        let got = reduce_by_values(&bodies).unwrap();
        assert_eq!(got.results.len(), 1);
        assert!(got.results[0].series.is_empty());

        // And it serializes without a series key at all.
        let json = serde_json::to_string(&got).unwrap();
        assert_eq!(json, r#"{"results":[{"statement_id":0}]}"#);
    }

    fn field_keys_body(per_measurement: &[(&str, &[&str])]) -> Vec<u8> {
        let series = per_measurement
            .iter()
            .map(|(name, fields)| {
                json!({
                    "name": name,
                    "columns": ["fieldKey", "fieldType"],
                    "values": fields.iter().map(|f| vec![*f, "float"]).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>();
        serde_json::to_vec(&json!({"results": [{"statement_id": 0, "series": series}]})).unwrap()
    }

    #[test]
    fn union_by_series_name() {
        let bodies = vec![
            field_keys_body(&[("cpu", &["usage"]), ("mem", &["free"])]),
            field_keys_body(&[("disk", &["used"]), ("cpu", &["usage"])]),
        ];

        let got = reduce_by_series(&bodies).unwrap();
        let series = &got.results[0].series;

        let names = series.iter().map(|s| s.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["cpu", "disk", "mem"]);
    }

    #[test]
    fn invalid_body_is_an_error() {
        let bodies: Vec<&[u8]> = vec![b"not json"];
        assert!(reduce_by_values(&bodies).is_err());
        assert!(reduce_by_series(&bodies).is_err());
    }

    #[test]
    fn error_envelope_roundtrip() {
        let rsp = Response::from_error("backends unavailable");
        let json = serde_json::to_string(&rsp).unwrap();
        assert_eq!(json, r#"{"error":"backends unavailable"}"#);
    }
}
