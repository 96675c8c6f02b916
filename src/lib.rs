//! Apparatus - experiment tracking server
//!
//! Records named runs with typed parameters, time-series metrics and file
//! artifacts, grouped into experiments and optionally nested up to two
//! levels deep. Everything is persisted in SQLite and browsable over HTTP.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod blob;
pub mod error;
pub mod hierarchy;
pub mod paths;
pub mod storage;
pub mod tree;
pub mod viewer;

pub use error::{Error, Result};

/// Deepest nesting level a run may have (root = 0, child = 1, grandchild = 2)
pub const MAX_NESTING_LEVEL: i64 = 2;

/// UUID of the experiment runs land in when none is given
pub const DEFAULT_EXPERIMENT_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Internal database identifier of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub i64);

/// A single recorded experiment execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    /// External identifier handed to clients
    pub uuid: String,
    pub name: String,
    pub notes: String,
    pub experiment_id: i64,
    pub parent_run_id: Option<RunId>,
    /// Number of ancestors; 0 for root runs
    pub nesting_level: i64,
    pub created_at: DateTime<Utc>,
}

impl Run {
    pub fn is_root(&self) -> bool {
        self.parent_run_id.is_none()
    }
}

/// A named group of runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub most_recent_run_at: Option<DateTime<Utc>>,
    pub run_count: u64,
}

/// Artifact metadata as stored per run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// `/`-delimited virtual path, unique per run
    pub path: String,
    /// Storage locator, `file://` followed by an absolute path
    pub uri: String,
    /// Display type inferred from the extension
    #[serde(rename = "type")]
    pub kind: String,
}

impl ArtifactRecord {
    pub fn new(path: impl Into<String>, uri: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            uri: uri.into(),
            kind: kind.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.kind == "image"
    }
}

/// Typed parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ParamValue {
    String(String),
    Bool(bool),
    Float(f64),
    Int(i64),
}

impl ParamValue {
    /// Parse a raw value according to its declared type name
    pub fn parse(kind: &str, raw: &str) -> Result<Self> {
        match kind {
            "string" => Ok(Self::String(raw.to_string())),
            "bool" => Ok(Self::Bool(raw == "true")),
            "float" => raw
                .trim()
                .parse()
                .map(Self::Float)
                .map_err(|_| Error::Validation(format!("not a float: {:?}", raw))),
            "int" => raw
                .trim()
                .parse()
                .map(Self::Int)
                .map_err(|_| Error::Validation(format!("not an int: {:?}", raw))),
            other => Err(Error::Validation(format!("unsupported value type: {}", other))),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Bool(_) => "bool",
            Self::Float(_) => "float",
            Self::Int(_) => "int",
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Float(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
        }
    }
}

/// A run parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub key: String,
    pub value: ParamValue,
}

/// One sample of a metric series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub x: f64,
    pub y: f64,
    pub logged_at: DateTime<Utc>,
}

/// All samples recorded under one metric key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub key: String,
    pub points: Vec<MetricPoint>,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub db_path: PathBuf,
    /// Directory all artifact blobs are written under
    pub artifact_store: PathBuf,
    /// Listen address
    pub host: [u8; 4],
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("apparatus.db"),
            artifact_store: PathBuf::from("artifacts"),
            host: [127, 0, 0, 1],
            port: 8080,
        }
    }
}

impl Config {
    /// Build a config from the `sqlite:///path` and `file://path` URI forms
    pub fn from_uris(db_uri: &str, store_uri: &str) -> Result<Self> {
        Ok(Self {
            db_path: parse_db_uri(db_uri)?,
            artifact_store: parse_store_uri(store_uri)?,
            ..Self::default()
        })
    }
}

/// `sqlite:///apparatus.db` -> `apparatus.db`, `sqlite:////var/db.sqlite` -> `/var/db.sqlite`
pub fn parse_db_uri(uri: &str) -> Result<PathBuf> {
    match uri.strip_prefix("sqlite:///") {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        Some(_) => Err(Error::Validation("empty sqlite database path".into())),
        None => Err(Error::Validation(format!(
            "unsupported connection string {:?} (expected sqlite:///path)",
            uri
        ))),
    }
}

/// `file://artifacts` -> `artifacts`, `file:///srv/artifacts` -> `/srv/artifacts`
pub fn parse_store_uri(uri: &str) -> Result<PathBuf> {
    match uri.strip_prefix("file://") {
        Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
        Some(_) => Err(Error::Validation("empty artifact store path".into())),
        None => Err(Error::UnsupportedScheme(uri.to_string())),
    }
}
