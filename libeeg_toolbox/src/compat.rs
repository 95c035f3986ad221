//! EDF compatibility checking.
//!
//! Each checked file gets a marker beside it: `<stem>.edf_pass` or `<stem>.edf_fail`, holding
//! the time of the check and the checker output. Files carrying either marker are never
//! checked again, which makes the pipeline scan safe to repeat.
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;
use walkdir::WalkDir;

use super::annotation::parse_record_annotations;
use super::constants::*;
use super::edf_header::{parse_start, EdfHeader, FileType};
use super::edf_reader::EdfReader;
use super::error::CompatError;
use super::resident::is_file_locked;
use super::timecalc::log_timestamp;

/// Tolerance when comparing time-keeping onsets of consecutive records
const ONSET_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub passed: bool,
    pub output: String,
}

/// Something that can judge whether a file is valid EDF
pub trait CompatChecker {
    fn check(&self, path: &Path) -> Result<CheckOutcome, CompatError>;
}

/// Runs an external program as `<program> --check-compatibility <file>`
#[derive(Debug, Clone)]
pub struct ExternalChecker {
    program: PathBuf,
}

impl ExternalChecker {
    pub fn new(program: &Path) -> Result<Self, CompatError> {
        if !program.is_file() {
            return Err(CompatError::BadCheckerPath(program.to_path_buf()));
        }
        Ok(Self {
            program: program.to_path_buf(),
        })
    }
}

impl CompatChecker for ExternalChecker {
    fn check(&self, path: &Path) -> Result<CheckOutcome, CompatError> {
        let result = Command::new(&self.program)
            .arg("--check-compatibility")
            .arg(path)
            .output()?;
        let mut output = String::from_utf8_lossy(&result.stdout).to_string();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        Ok(CheckOutcome {
            passed: !output.contains(INVALID_EDF_MARKER),
            output,
        })
    }
}

/// Validates the header and record layout directly
#[derive(Debug, Clone, Default)]
pub struct NativeChecker;

impl CompatChecker for NativeChecker {
    fn check(&self, path: &Path) -> Result<CheckOutcome, CompatError> {
        let problems = validate_edf(path)?;
        let output = if problems.is_empty() {
            format!("{} is a valid EDF file\n", path.display())
        } else {
            let mut text = format!("{} is {INVALID_EDF_MARKER} file:\n", path.display());
            for problem in problems {
                text.push_str(&format!("  - {problem}\n"));
            }
            text
        };
        Ok(CheckOutcome {
            passed: !output.contains(INVALID_EDF_MARKER),
            output,
        })
    }
}

fn field(bytes: &[u8], start: usize, end: usize) -> String {
    String::from_utf8_lossy(&bytes[start..end]).trim().to_string()
}

fn non_printable(bytes: &[u8]) -> Option<usize> {
    bytes.iter().position(|b| !(0x20..=0x7E).contains(b))
}

/// List every problem found in `path`. An empty list means the file is valid.
pub fn validate_edf(path: &Path) -> Result<Vec<String>, CompatError> {
    if !path.is_file() {
        return Err(CompatError::BadFilePath(path.to_path_buf()));
    }
    let mut problems = Vec::new();
    let file_size = std::fs::metadata(path)?.len();
    let mut file = File::open(path)?;

    let mut main = [0u8; MAIN_HEADER_BYTES];
    if file_size < MAIN_HEADER_BYTES as u64 {
        problems.push(format!("file is only {file_size} bytes, smaller than the header"));
        return Ok(problems);
    }
    file.read_exact(&mut main)?;
    if main[0] == 0xFF {
        problems.push(String::from("file is BDF, not EDF"));
        return Ok(problems);
    }
    if let Some(pos) = non_printable(&main) {
        problems.push(format!("header contains a non-printable character at byte {pos}"));
    }
    if field(&main, 0, 8) != EDF_VERSION {
        problems.push(format!("version field is {:?}, expected \"0\"", field(&main, 0, 8)));
    }
    if let Err(e) = parse_start(&field(&main, 168, 176), &field(&main, 176, 184)) {
        problems.push(e.to_string());
    }
    let ns: i64 = match field(&main, 252, 256).parse() {
        Ok(ns) if ns >= 1 => ns,
        _ => {
            problems.push(format!("number of signals {:?} is invalid", field(&main, 252, 256)));
            return Ok(problems);
        }
    };
    let expected_header = MAIN_HEADER_BYTES as u64 * (ns as u64 + 1);
    match field(&main, 184, 192).parse::<u64>() {
        Ok(size) if size == expected_header => (),
        _ => problems.push(format!(
            "header size field {:?} should be {expected_header}",
            field(&main, 184, 192)
        )),
    }
    if file_size < expected_header {
        problems.push(String::from("file ends inside the signal headers"));
        return Ok(problems);
    }

    let mut block = vec![0u8; ns as usize * SIGNAL_HEADER_BYTES];
    file.read_exact(&mut block)?;
    if let Some(pos) = non_printable(&block) {
        problems.push(format!(
            "signal headers contain a non-printable character at byte {}",
            pos + MAIN_HEADER_BYTES
        ));
    }
    let mut raw = main.to_vec();
    raw.extend_from_slice(&block);
    let header = match EdfHeader::read_from(&mut raw.as_slice()) {
        Ok(header) => header,
        Err(e) => {
            problems.push(e.to_string());
            return Ok(problems);
        }
    };

    problems.extend(check_header_values(&header));
    let record_size = header.record_size_bytes() as u64;
    if record_size == 0 {
        return Ok(problems);
    }
    let data_bytes = file_size - expected_header;
    if data_bytes % record_size != 0 {
        problems.push(format!(
            "file holds a partial data record ({} trailing bytes)",
            data_bytes % record_size
        ));
    }
    if header.num_data_records != (data_bytes / record_size) as i64 {
        problems.push(format!(
            "header declares {} data records but the file holds {}",
            header.num_data_records,
            data_bytes / record_size
        ));
    }

    let annotation_signal = header.annotation_signals().first().copied();
    if let (true, Some(signal)) = (header.file_type().is_plus(), annotation_signal) {
        problems.extend(check_timekeeping(path, signal, header.file_type())?);
    }
    Ok(problems)
}

fn check_header_values(header: &EdfHeader) -> Vec<String> {
    let mut problems = Vec::new();
    if !(header.record_duration > 0.0) {
        problems.push(format!(
            "data record duration {} must be positive",
            header.record_duration
        ));
    }
    for (idx, signal) in header.signals.iter().enumerate() {
        let name = format!("signal {} ({})", idx + 1, signal.label);
        if signal.digital_min < i16::MIN as i32 || signal.digital_max > i16::MAX as i32 {
            problems.push(format!("{name}: digital range exceeds 16 bits"));
        }
        if signal.digital_min >= signal.digital_max {
            problems.push(format!("{name}: digital minimum must be below digital maximum"));
        }
        if signal.physical_min == signal.physical_max {
            problems.push(format!("{name}: physical minimum equals physical maximum"));
        }
        if signal.samples_per_record < 1 {
            problems.push(format!("{name}: samples per record must be at least 1"));
        }
    }
    if header.file_type().is_plus() {
        if header.annotation_signals().is_empty() {
            problems.push(String::from("EDF+ file has no EDF Annotations signal"));
        }
        if header.patient_info().is_none() {
            problems.push(String::from(
                "EDF+ patient field needs code, sex, birthdate and name subfields",
            ));
        }
        if header.recording_info().is_none() {
            problems.push(String::from(
                "EDF+ recording field must start with Startdate followed by four subfields",
            ));
        }
    }
    problems
}

/// Every EDF+ record must open with a time-keeping TAL; in EDF+C the onsets must also
/// advance by exactly one record duration.
fn check_timekeeping(
    path: &Path,
    signal: usize,
    file_type: FileType,
) -> Result<Vec<String>, CompatError> {
    let mut problems = Vec::new();
    let mut reader = match EdfReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            problems.push(e.to_string());
            return Ok(problems);
        }
    };
    let duration = reader.header().record_duration;
    let mut first_onset = None;
    for record in 0..reader.num_records() {
        let bytes = match reader.read_annotation_block(record, signal) {
            Ok(bytes) => bytes,
            Err(e) => {
                problems.push(e.to_string());
                break;
            }
        };
        let Some(onset) = parse_record_annotations(&bytes).0 else {
            problems.push(format!("data record {record} has no time-keeping TAL"));
            break;
        };
        let first = *first_onset.get_or_insert(onset);
        let expected = first + record as f64 * duration;
        if file_type == FileType::EdfPlusContinuous && (onset - expected).abs() > ONSET_TOLERANCE {
            problems.push(format!(
                "data record {record} starts at {onset} s, expected {expected} s in a continuous file"
            ));
            break;
        }
    }
    Ok(problems)
}

fn marker_paths(path: &Path) -> (PathBuf, PathBuf) {
    (
        path.with_extension(PASS_EXTENSION),
        path.with_extension(FAIL_EXTENSION),
    )
}

pub fn has_marker(path: &Path) -> bool {
    let (pass, fail) = marker_paths(path);
    pass.exists() || fail.exists()
}

/// Check one file and write its marker. Returns `None` when the file already has one.
pub fn check_file(checker: &dyn CompatChecker, path: &Path) -> Result<Option<bool>, CompatError> {
    if !path.is_file() {
        return Err(CompatError::BadFilePath(path.to_path_buf()));
    }
    if has_marker(path) {
        log::info!("Skipping (already processed): {}", path.display());
        return Ok(None);
    }

    let timestamp = log_timestamp()?;
    let started = Instant::now();
    let outcome = checker.check(path)?;
    let elapsed = started.elapsed().as_secs_f64();

    let (pass, fail) = marker_paths(path);
    let marker = if outcome.passed { pass } else { fail };
    let report = format!(
        "Timestamp: {timestamp}\nFile: {}\nElapsed Time: {elapsed:.2} seconds\n\nOutput:\n{}",
        path.display(),
        outcome.output
    );
    std::fs::write(&marker, report)?;
    if outcome.passed {
        log::info!("Passed: {}", path.display());
    } else {
        log::warn!("Failed: {} (see {})", path.display(), marker.display());
    }
    Ok(Some(outcome.passed))
}

fn is_edf(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("edf"))
}

pub fn find_edf_files(folder: &Path, recursive: bool) -> Result<Vec<PathBuf>, CompatError> {
    let mut walker = WalkDir::new(folder).min_depth(1).sort_by_file_name();
    if !recursive {
        walker = walker.max_depth(1);
    }
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() && is_edf(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Folder names of the form `sub-<digits>`, any case
pub fn is_subject_folder(name: &str) -> bool {
    match (name.get(..4), name.get(4..)) {
        (Some(prefix), Some(digits)) => {
            prefix.eq_ignore_ascii_case("sub-")
                && !digits.is_empty()
                && digits.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub passed: usize,
    pub failed: usize,
    pub locked: usize,
}

/// One pass over a pipeline folder. Only top-level subject folders are descended, but
/// everything beneath them is checked.
pub fn scan_pipeline(
    main_folder: &Path,
    checker: &dyn CompatChecker,
) -> Result<ScanSummary, CompatError> {
    let mut summary = ScanSummary::default();
    let walker = WalkDir::new(main_folder)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1
                || !e.file_type().is_dir()
                || is_subject_folder(&e.file_name().to_string_lossy())
        });
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type().is_file() || !is_edf(path) || has_marker(path) {
            continue;
        }
        if is_file_locked(path) {
            log::warn!("[Locked] Skipping in-use file: {}", path.display());
            summary.locked += 1;
            continue;
        }
        log::info!("[Processing] Checking: {}", path.display());
        match check_file(checker, path)? {
            Some(true) => summary.passed += 1,
            Some(false) => summary.failed += 1,
            None => (),
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf_header::tests::eeg_signal;
    use crate::edf_writer::{EdfWriter, WriterSetup};
    use time::macros::datetime;

    fn write_valid(path: &Path, records: usize) {
        let setup = WriterSetup::new(
            "MRN1 F 01-JAN-1990 Pat_Ient",
            "Startdate 01-JAN-2024 A1 Tech Amp",
            datetime!(2024-01-01 09:00:00),
            1.0,
            vec![eeg_signal("EEG T3", 16)],
        );
        let mut writer = EdfWriter::create(path, setup).unwrap();
        for _ in 0..records {
            writer.write_record(&[&[5; 16]]).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_native_accepts_writer_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.edf");
        write_valid(&path, 3);
        assert_eq!(validate_edf(&path).unwrap(), Vec::<String>::new());
        assert!(NativeChecker.check(&path).unwrap().passed);
    }

    #[test]
    fn test_native_reports_partial_record_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.edf");
        write_valid(&path, 3);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 10);
        std::fs::write(&path, &bytes).unwrap();

        let problems = validate_edf(&path).unwrap();
        assert!(problems.iter().any(|p| p.contains("partial data record")));
        assert!(problems.iter().any(|p| p.contains("declares 3 data records")));
        let outcome = NativeChecker.check(&path).unwrap();
        assert!(!outcome.passed);
        assert!(outcome.output.contains(INVALID_EDF_MARKER));
    }

    #[test]
    fn test_native_requires_timekeeping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tal.edf");
        write_valid(&path, 2);
        let mut bytes = std::fs::read(&path).unwrap();
        // second record: 768 header bytes + 1 record of (32 + 138) + 32 signal bytes
        let start = 768 + 170 + 32;
        bytes[start..start + 138].fill(0);
        std::fs::write(&path, &bytes).unwrap();

        let problems = validate_edf(&path).unwrap();
        assert_eq!(problems, vec!["data record 1 has no time-keeping TAL"]);
    }

    #[test]
    fn test_check_file_writes_marker_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_valid(&path, 1);

        assert_eq!(check_file(&NativeChecker, &path).unwrap(), Some(true));
        let marker = std::fs::read_to_string(dir.path().join("rec.edf_pass")).unwrap();
        assert!(marker.starts_with("Timestamp: "));
        assert!(marker.contains("Output:\n"));
        assert_eq!(check_file(&NativeChecker, &path).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_external_checker_reads_output() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.edf");
        let bad = dir.path().join("NOT a valid EDF.edf");
        std::fs::write(&good, b"x").unwrap();
        std::fs::write(&bad, b"x").unwrap();

        // echo repeats its arguments, so the file name decides the verdict
        let checker = ExternalChecker::new(Path::new("/bin/echo")).unwrap();
        assert_eq!(check_file(&checker, &good).unwrap(), Some(true));
        assert_eq!(check_file(&checker, &bad).unwrap(), Some(false));
        assert!(dir.path().join("NOT a valid EDF.edf_fail").exists());
        assert!(matches!(
            ExternalChecker::new(&dir.path().join("nope")),
            Err(CompatError::BadCheckerPath(_))
        ));
    }

    #[test]
    fn test_pipeline_descends_subject_folders_only() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("sub-001").join("ses-01").join("ieeg");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::create_dir_all(dir.path().join("archive")).unwrap();
        write_valid(&deep.join("a.edf"), 1);
        write_valid(&dir.path().join("archive").join("b.edf"), 1);

        let summary = scan_pipeline(dir.path(), &NativeChecker).unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                passed: 1,
                failed: 0,
                locked: 0
            }
        );
        assert!(deep.join("a.edf_pass").exists());
        assert!(!dir.path().join("archive").join("b.edf_pass").exists());
        assert_eq!(scan_pipeline(dir.path(), &NativeChecker).unwrap().passed, 0);
    }

    #[test]
    fn test_find_edf_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("inner")).unwrap();
        std::fs::write(dir.path().join("a.EDF"), b"").unwrap();
        std::fs::write(dir.path().join("inner").join("b.edf"), b"").unwrap();
        assert_eq!(find_edf_files(dir.path(), false).unwrap().len(), 1);
        assert_eq!(find_edf_files(dir.path(), true).unwrap().len(), 2);
        assert!(is_subject_folder("SUB-12"));
        assert!(!is_subject_folder("sub-12a"));
        assert!(!is_subject_folder("sub-"));
    }

    #[test]
    fn test_non_ascii_folder_names() {
        assert!(!is_subject_folder("aéé"));
        assert!(!is_subject_folder("aéé1"));
        assert!(!is_subject_folder("sub-１２"));

        let dir = tempfile::tempdir().unwrap();
        let odd = dir.path().join("aéé1");
        std::fs::create_dir_all(&odd).unwrap();
        write_valid(&odd.join("a.edf"), 1);
        let subject = dir.path().join("sub-002");
        std::fs::create_dir_all(&subject).unwrap();
        write_valid(&subject.join("b.edf"), 1);

        let summary = scan_pipeline(dir.path(), &NativeChecker).unwrap();
        assert_eq!(summary.passed, 1);
        assert!(!odd.join("a.edf_pass").exists());
    }
}
