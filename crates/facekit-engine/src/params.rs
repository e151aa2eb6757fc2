//! Runtime recognition parameters (`k-nearest`, `threshold`, `accuracy`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub const PARAM_K_NEAREST: &str = "k-nearest";
pub const PARAM_THRESHOLD: &str = "threshold";
pub const PARAM_ACCURACY: &str = "accuracy";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: ParamValue },
}

/// Loosely typed parameter value, as handed over by UI code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            ParamValue::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Non-negative whole number.
    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ParamValue::Int(i) => usize::try_from(*i).ok(),
            ParamValue::Float(f) if f.is_finite() && *f >= 0.0 && f.fract() == 0.0 => Some(*f as usize),
            ParamValue::Float(_) => None,
            ParamValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{i}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v.into())
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(v)
    }
}

pub type Parameters = BTreeMap<String, ParamValue>;

/// The single classifier change one `set_parameters` call makes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamChange {
    KNeighbors(usize),
    Threshold(f32),
}

/// Pick the change requested by `params`.
///
/// Keys are examined in a fixed order, `k-nearest` then `threshold` then
/// `accuracy`, and only the first one present is applied. A call carrying
/// both `k-nearest` and `threshold` changes k only.
pub fn resolve(params: &Parameters) -> Result<Option<ParamChange>, ParamError> {
    if let Some(value) = params.get(PARAM_K_NEAREST) {
        match value.as_usize() {
            Some(k) if k >= 1 => Ok(Some(ParamChange::KNeighbors(k))),
            _ => Err(ParamError::Invalid {
                key: PARAM_K_NEAREST,
                value: value.clone(),
            }),
        }
    } else if let Some(value) = params.get(PARAM_THRESHOLD) {
        fraction(PARAM_THRESHOLD, value).map(|t| Some(ParamChange::Threshold(t)))
    } else if let Some(value) = params.get(PARAM_ACCURACY) {
        fraction(PARAM_ACCURACY, value).map(|t| Some(ParamChange::Threshold(t)))
    } else {
        Ok(None)
    }
}

fn fraction(key: &'static str, value: &ParamValue) -> Result<f32, ParamError> {
    match value.as_f64() {
        Some(v) if v.is_finite() && (0.0..=1.0).contains(&v) => Ok(v as f32),
        _ => Err(ParamError::Invalid {
            key,
            value: value.clone(),
        }),
    }
}
