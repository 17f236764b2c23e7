use core::fmt::Display;
use core::fmt::Formatter;
use core::fmt::Result as FmtResult;
use std::error::Error;
use std::io::Error as IoError;
use std::path::PathBuf;

pub use gdal::errors::GdalError;

/// Failures of the engine itself. Per-feature geometry defects are not
/// represented here; those become [`crate::report::ValidationError`]
/// records in the result set and the pass keeps going.
#[derive(Debug)]
pub enum EngineError {
    /// Malformed rule row, unknown layer, negative tolerance and the like.
    /// Aborts the stage before any feature is read.
    InputInvalid(String),
    UnknownLayer(String),
    NegativeTolerance(String, f64),
    /// The underlying store could not be opened or read.
    Gdal(GdalError),
    StoreOpen(PathBuf, String),
    StoreWrite(String),
    WktIn(String),
    WktOut(String),
    RuleTableRead(String),
    RuleFileRead(String),
    /// Cooperative cancellation fired; partial results are preserved.
    Cancelled,
    /// An index build or a per-feature budget was exceeded.
    Timeout { what: String, processed: usize },
    Io(String),
    Json(String),
}

impl Error for EngineError {}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::InputInvalid(a) => write!(f, "invalid input: {a}"),
            Self::UnknownLayer(a) => write!(f, "layer '{a}' does not exist in the store"),
            Self::NegativeTolerance(rule, value) => {
                write!(f, "rule '{rule}' declares a negative tolerance ({value})")
            }
            Self::Gdal(a) => write!(f, "gdal: {a}"),
            Self::StoreOpen(path, message) => {
                write!(f, "could not open store {path:?}: {message}")
            }
            Self::StoreWrite(a) => write!(f, "could not write to the error store: {a}"),
            Self::WktIn(a) => write!(f, "could not parse WKT: {a}"),
            Self::WktOut(a) => write!(f, "could not export WKT: {a}"),
            Self::RuleTableRead(a) => write!(f, "error reading rule table: {a}"),
            Self::RuleFileRead(a) => write!(f, "error reading rule file: {a}"),
            Self::Cancelled => write!(f, "validation run was cancelled"),
            Self::Timeout { what, processed } => {
                write!(f, "{what} timed out after {processed} features")
            }
            Self::Io(a) => write!(f, "io: {a}"),
            Self::Json(a) => write!(f, "error serializing data: {a}"),
        }
    }
}

impl From<GdalError> for EngineError {
    fn from(value: GdalError) -> Self {
        Self::Gdal(value)
    }
}

impl From<IoError> for EngineError {
    fn from(value: IoError) -> Self {
        Self::Io(format!("{value}"))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(format!("{value}"))
    }
}

impl From<csv::Error> for EngineError {
    fn from(value: csv::Error) -> Self {
        Self::RuleTableRead(format!("{value}"))
    }
}

impl EngineError {
    /// Exit code vocabulary of the CLI: 2 configuration, 3 I/O, 4 cancelled.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InputInvalid(_)
            | Self::UnknownLayer(_)
            | Self::NegativeTolerance(_, _)
            | Self::RuleTableRead(_)
            | Self::RuleFileRead(_) => 2,
            Self::Cancelled => 4,
            _ => 3,
        }
    }
}
