// EDF layout
pub const MAIN_HEADER_BYTES: usize = 256;
pub const SIGNAL_HEADER_BYTES: usize = 256;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const EDF_VERSION: &str = "0";
pub const EDF_PLUS_CONTINUOUS: &str = "EDF+C";
pub const EDF_PLUS_DISCONTINUOUS: &str = "EDF+D";
pub const ANNOTATION_LABEL: &str = "EDF Annotations";

// TAL delimiters
pub const TAL_DURATION_MARK: u8 = 0x15;
pub const TAL_SEPARATOR: u8 = 0x14;
pub const TAL_TERMINATOR: u8 = 0x00;

// Writer annotation layout
pub const TIMEKEEPING_BYTES: usize = 24;
pub const ANNOTATION_SLOT_BYTES: usize = 114;
pub const DEFAULT_ANNOTATION_SLOTS: usize = 1;

// Marker extensions written beside processed files
pub const PASS_EXTENSION: &str = "edf_pass";
pub const FAIL_EXTENSION: &str = "edf_fail";
pub const MD5_EXTENSION: &str = "md5";
pub const SHALOG_EXTENSION: &str = "shalog";
pub const EQUAL_EXTENSION: &str = "equal";
pub const DIFF_EXTENSION: &str = "diff";
pub const CONFIRM_EQUAL_EXTENSION: &str = "confirm_equal";

/// Output of the external checker when a file fails
pub const INVALID_EDF_MARKER: &str = "NOT a valid EDF";

/// File name endings that receive an MD5 sidecar
pub const MD5_TARGET_EXTENSIONS: [&str; 4] = [".edf", ".edfz", ".rar", ".RAR"];

pub const DEFAULT_MD5_BUFFER: usize = 32 * 1024 * 1024;
pub const DEFAULT_HASH_CHUNK: usize = 100 * 1024;

/// Daily recording hours below which a day counts as incomplete
pub const MIN_DAILY_HOURS: f64 = 23.0;
