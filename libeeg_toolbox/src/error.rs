use std::path::PathBuf;
use thiserror::Error;

use super::worker_status::WorkerStatus;

#[derive(Debug, Error)]
pub enum EdfHeaderError {
    #[error("Failed to read EDF header: {0}")]
    IOError(#[from] std::io::Error),
    #[error("EDF header is truncated; expected at least {0} bytes")]
    Truncated(usize),
    #[error("BDF files are not supported")]
    BdfNotSupported,
    #[error("Invalid EDF version field {0:?}")]
    BadVersion(String),
    #[error("EDF header field {field} holds a non-numeric value {value:?}")]
    BadNumber { field: &'static str, value: String },
    #[error("EDF header has an invalid start date/time {0:?}")]
    BadDateTime(String),
    #[error("EDF header declares {0} signals")]
    BadSignalCount(i64),
    #[error("EDF header value {value} does not fit in a {width} character field")]
    FieldOverflow { value: String, width: usize },
}

#[derive(Debug, Error)]
pub enum EdfReaderError {
    #[error("Could not open EDF file because {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("EdfReader failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("EdfReader failed to parse header: {0}")]
    HeaderError(#[from] EdfHeaderError),
    #[error("Signal index {0} is out of range for this EDF file")]
    BadSignal(usize),
    #[error("Data record {0} is out of range for this EDF file")]
    BadRecord(u64),
    #[error("EDF file holds no complete data records")]
    NoRecords,
}

#[derive(Debug, Error)]
pub enum EdfWriterError {
    #[error("EdfWriter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("EdfWriter failed to build header: {0}")]
    HeaderError(#[from] EdfHeaderError),
    #[error("EdfWriter was given {0} signals, expected {1}")]
    SignalCountMismatch(usize, usize),
    #[error("EdfWriter was given {given} samples for signal {signal}, expected {expected}")]
    SampleCountMismatch {
        signal: usize,
        given: usize,
        expected: usize,
    },
    #[error("EdfWriter needs at least one signal")]
    NoSignals,
    #[error("EdfWriter was given an invalid record duration {0}")]
    BadRecordDuration(f64),
}

#[derive(Debug, Error)]
pub enum SplitterError {
    #[error("Splitter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Splitter failed due to EdfReader error: {0}")]
    ReaderError(#[from] EdfReaderError),
    #[error("Splitter failed due to EdfWriter error: {0}")]
    WriterError(#[from] EdfWriterError),
    #[error("Splitter was given invalid options: {0}")]
    BadOptions(String),
    #[error("Splitter input {0:?} has no ordinary signals")]
    NoSignals(PathBuf),
    #[error("Splitter could not shape a chunk: {0}")]
    ShapeError(#[from] ndarray::ShapeError),
    #[error("Splitter failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}

#[derive(Debug, Error)]
pub enum ClipperError {
    #[error("Clipper failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Clipper failed due to EdfReader error: {0}")]
    ReaderError(#[from] EdfReaderError),
    #[error("Clipper failed due to EdfWriter error: {0}")]
    WriterError(#[from] EdfWriterError),
    #[error("Clipper failed to parse the clip request: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Invalid clipping range: {0} to {1} seconds")]
    InvalidRange(f64, f64),
    #[error("No valid signals selected for clipping")]
    NoSignalsSelected,
    #[error("Clipper failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Clipper failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("Scanner failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Scanner failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Scanner failed to write CSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Scanner failed to write JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Scanner failed due to EdfReader error: {0}")]
    ReaderError(#[from] EdfReaderError),
    #[error("Scanner failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Unsupported output format {0:?}; use .csv, .txt or .json")]
    UnsupportedFormat(String),
}

#[derive(Debug, Error)]
pub enum CompatError {
    #[error("Compatibility check failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Compatibility check failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Compatibility checker executable {0:?} not found")]
    BadCheckerPath(PathBuf),
    #[error("Could not check EDF because {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Compatibility check failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("Checksum failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Checksum failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Checksum failed to read EDF header: {0}")]
    ReaderError(#[from] EdfReaderError),
    #[error("Checksum log could not be parsed: {0}")]
    ParsingError(#[from] serde_json::Error),
    #[error("Header size mismatch: expected {expected}, got {actual}")]
    HeaderSizeMismatch { expected: usize, actual: usize },
    #[error("Unsupported hash algorithm {0:?}")]
    UnsupportedAlgorithm(String),
    #[error("Checksum failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Checksum failed due to Send error: {0}")]
    SendError(#[from] std::sync::mpsc::SendError<WorkerStatus>),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive tool failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Archive tool failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Archive tool failed due to checksum error: {0}")]
    ChecksumError(#[from] ChecksumError),
    #[error("Archiver {program:?} exited with status {status}: {stderr}")]
    ArchiverFailed {
        program: PathBuf,
        status: i32,
        stderr: String,
    },
    #[error("Entry {entry} was not found in archive {archive:?}")]
    MissingEntry { archive: PathBuf, entry: String },
    #[error("Archiver listing could not be parsed: {0}")]
    BadListing(String),
}

#[derive(Debug, Error)]
pub enum RedactionError {
    #[error("Redaction failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Redaction failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Redaction failed to read CSV/TSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Redaction failed to handle JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Redaction failed to compile a name pattern: {0}")]
    RegexError(#[from] regex::Error),
    #[error("Redaction failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Name list {0:?} does not exist")]
    BadNameList(PathBuf),
    #[error("Name list is missing the {0:?} column")]
    MissingColumn(&'static str),
    #[error("File {0:?} is not inside input folder {1:?}")]
    OutsideInput(PathBuf, PathBuf),
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Reconcile failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Reconcile failed to read CSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Reconcile was given an invalid pattern: {0}")]
    PatternError(#[from] glob::PatternError),
    #[error("Reconcile failed to read a glob match: {0}")]
    GlobError(#[from] glob::GlobError),
    #[error("Reconcile failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Sheet is missing the {0:?} column")]
    MissingColumn(&'static str),
    #[error("Directory {0:?} does not exist")]
    BadDirectory(PathBuf),
    #[error("List file {0:?} does not exist")]
    BadListFile(PathBuf),
}

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("Coverage check failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Coverage check failed to read TSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Coverage check could not parse acquisition time {0:?}")]
    BadAcqTime(String),
    #[error("Coverage check failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Coverage check found no sessions in {0:?}")]
    NoSessions(PathBuf),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Sync failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Sync failed to walk directory: {0}")]
    WalkError(#[from] walkdir::Error),
    #[error("Sync failed due to SQLite error: {0}")]
    SqlError(#[from] rusqlite::Error),
    #[error("Sync failed to read/write CSV: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Sync failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Path {0:?} is not absolute and has no root to strip")]
    NoAnchor(PathBuf),
}

#[derive(Debug, Error)]
pub enum TimeCalcError {
    #[error("Invalid HH:MM:SS value {0:?}")]
    BadClock(String),
    #[error("Total duration must be positive")]
    ZeroDuration,
    #[error("Serial date {0} is out of range")]
    BadSerial(f64),
    #[error("Failed to format time: {0}")]
    TimeFormat(#[from] time::error::Format),
}

#[derive(Debug, Error)]
pub enum ConverterError {
    #[error("Converter failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Converter failed due to configuration error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Converter failed to format timestamp: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("Converter failed to build session pattern: {0}")]
    PatternError(#[from] regex::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration as file {0:?} does not exist")]
    BadFilePath(PathBuf),
    #[error("Config failed due to IO error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("Config failed to parse YAML: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Config is missing required setting {0}")]
    MissingSetting(&'static str),
}
