//! Experiment configurations and parameter sweeps.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Default chunk sizes of the chunk-size sweep preset.
pub const DEFAULT_CHUNK_SIZES: [usize; 3] = [250, 500, 1000];
/// Default K values of the retrieval-depth sweep preset.
pub const DEFAULT_K_VALUES: [usize; 3] = [3, 5, 7];
/// Chunk overlap used by the chunk-size preset, in percent of the chunk size.
pub const DEFAULT_OVERLAP_PERCENT: usize = 15;

/// A configuration parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl ParamValue {
    /// Numeric view used for trend ordering; text and bools have none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(i) => Some(*i as f64),
            ParamValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Parse a command-line value: integer, float, bool, else text.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(i) = raw.parse::<i64>() {
            ParamValue::Int(i)
        } else if let Ok(f) = raw.parse::<f64>() {
            ParamValue::Float(f)
        } else if let Ok(b) = raw.parse::<bool>() {
            ParamValue::Bool(b)
        } else {
            ParamValue::Text(raw.to_string())
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(i) => write!(f, "{}", i),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value.into())
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

/// A named set of pipeline parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, ParamValue>,
}

impl ExperimentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    /// Non-negative integer parameter. Any other value type is a configuration error.
    pub fn get_usize(&self, key: &str) -> Result<Option<usize>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(ParamValue::Int(i)) => usize::try_from(*i).map(Some).map_err(|_| {
                EvalError::Configuration(format!(
                    "parameter '{}' must be a non-negative integer, got {}",
                    key, i
                ))
            }),
            Some(other) => Err(EvalError::Configuration(format!(
                "parameter '{}' must be an integer, got '{}'",
                key, other
            ))),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(value) => value.as_f64().map(Some).ok_or_else(|| {
                EvalError::Configuration(format!(
                    "parameter '{}' must be a number, got '{}'",
                    key, value
                ))
            }),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        match self.params.get(key) {
            None => Ok(None),
            Some(ParamValue::Text(s)) => Ok(Some(s)),
            Some(other) => Err(EvalError::Configuration(format!(
                "parameter '{}' must be text, got '{}'",
                key, other
            ))),
        }
    }

    /// Retrieval depth from `k` (or its alias `top_k`), falling back to `default`.
    pub fn retrieval_k(&self, default: usize) -> Result<usize> {
        let k = match self.get_usize("k")? {
            Some(k) => Some(k),
            None => self.get_usize("top_k")?,
        };
        match k.unwrap_or(default) {
            0 => Err(EvalError::Configuration(
                "retrieval depth k must be at least 1".to_string(),
            )),
            k => Ok(k),
        }
    }
}

/// Configurations generated by varying one parameter of a base configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSweep {
    base: ExperimentConfig,
    parameter: String,
    points: Vec<(ParamValue, BTreeMap<String, ParamValue>)>,
}

impl ParameterSweep {
    pub fn new<I, V>(base: ExperimentConfig, parameter: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<ParamValue>,
    {
        Self {
            base,
            parameter: parameter.into(),
            points: values
                .into_iter()
                .map(|v| (v.into(), BTreeMap::new()))
                .collect(),
        }
    }

    /// Chunk-size sweep with overlap set to a fixed percentage of each size.
    pub fn chunk_sizes(base: ExperimentConfig, sizes: &[usize], overlap_percent: usize) -> Self {
        let points = sizes
            .iter()
            .map(|&size| {
                let mut linked = BTreeMap::new();
                linked.insert(
                    "chunk_overlap".to_string(),
                    ParamValue::from(size * overlap_percent / 100),
                );
                (ParamValue::from(size), linked)
            })
            .collect();

        Self {
            base,
            parameter: "chunk_size".to_string(),
            points,
        }
    }

    /// Retrieval-depth sweep over `k`.
    pub fn k_values(base: ExperimentConfig, values: &[usize]) -> Self {
        Self::new(base, "k", values.iter().copied())
    }

    pub fn parameter(&self) -> &str {
        &self.parameter
    }

    pub fn values(&self) -> Vec<ParamValue> {
        self.points.iter().map(|(v, _)| v.clone()).collect()
    }

    /// One configuration per value, named `<param>=<value>`, in the given order.
    pub fn configurations(&self) -> Vec<ExperimentConfig> {
        self.points
            .iter()
            .map(|(value, linked)| {
                let mut config = self.base.clone();
                config.name = format!("{}={}", self.parameter, value);
                config.params.insert(self.parameter.clone(), value.clone());
                for (key, linked_value) in linked {
                    config.params.insert(key.clone(), linked_value.clone());
                }
                config
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_value_parse_and_display() {
        assert_eq!(ParamValue::parse("500"), ParamValue::Int(500));
        assert_eq!(ParamValue::parse("0.5"), ParamValue::Float(0.5));
        assert_eq!(ParamValue::parse("true"), ParamValue::Bool(true));
        assert_eq!(ParamValue::parse("llama3"), ParamValue::Text("llama3".into()));
        assert_eq!(ParamValue::Int(3).to_string(), "3");
    }

    #[test]
    fn test_param_value_untagged_serde() {
        let config = ExperimentConfig::new("c")
            .with_param("k", 5usize)
            .with_param("model", "llama3")
            .with_param("rerank", false);
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"k\":5"));
        let back: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_retrieval_k() {
        let config = ExperimentConfig::new("c");
        assert_eq!(config.retrieval_k(4).unwrap(), 4);

        let config = ExperimentConfig::new("c").with_param("top_k", 7usize);
        assert_eq!(config.retrieval_k(4).unwrap(), 7);

        let config = ExperimentConfig::new("c").with_param("k", 0usize);
        assert!(matches!(
            config.retrieval_k(4),
            Err(EvalError::Configuration(_))
        ));

        let config = ExperimentConfig::new("c").with_param("k", "many");
        assert!(matches!(
            config.retrieval_k(4),
            Err(EvalError::Configuration(_))
        ));

        let config = ExperimentConfig::new("c").with_param("k", -2i64);
        assert!(config.retrieval_k(4).is_err());
    }

    #[test]
    fn test_sweep_configurations() {
        let base = ExperimentConfig::new("base").with_param("chunk_size", 500usize);
        let sweep = ParameterSweep::k_values(base, &DEFAULT_K_VALUES);
        let configs = sweep.configurations();

        let names: Vec<_> = configs.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["k=3", "k=5", "k=7"]);
        assert_eq!(configs[1].get_usize("k").unwrap(), Some(5));
        assert_eq!(configs[1].get_usize("chunk_size").unwrap(), Some(500));
    }

    #[test]
    fn test_chunk_size_preset_links_overlap() {
        let sweep = ParameterSweep::chunk_sizes(
            ExperimentConfig::new("base"),
            &DEFAULT_CHUNK_SIZES,
            DEFAULT_OVERLAP_PERCENT,
        );
        let configs = sweep.configurations();

        assert_eq!(sweep.parameter(), "chunk_size");
        assert_eq!(configs[0].name, "chunk_size=250");
        assert_eq!(configs[0].get_usize("chunk_overlap").unwrap(), Some(37));
        assert_eq!(configs[2].get_usize("chunk_overlap").unwrap(), Some(150));
    }
}
