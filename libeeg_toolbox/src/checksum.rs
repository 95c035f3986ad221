use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use time::macros::format_description;
use walkdir::WalkDir;

use super::constants::*;
use super::edf_reader::EdfReader;
use super::error::ChecksumError;
use super::resident::is_file_locked;
use super::worker_status::{Phase, WorkerStatus};

const SHA256_NAME: &str = "sha256";

/// `path` with `.ext` appended to the full file name, e.g. `a.edf` -> `a.edf.md5`
pub fn sidecar_path(path: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// Fill `buffer` from `reader`, stopping early only at end of file
fn read_full<R: Read>(reader: &mut R, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Hex MD5 digest of a file, read `buffer_size` bytes at a time
pub fn compute_md5(path: &Path, buffer_size: usize) -> Result<String, ChecksumError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; buffer_size.max(1)];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Write `<file>.md5` holding the digest
pub fn write_checksum(path: &Path, digest: &str) -> Result<PathBuf, ChecksumError> {
    let checksum_path = sidecar_path(path, MD5_EXTENSION);
    std::fs::write(&checksum_path, digest)?;
    Ok(checksum_path)
}

/// The digest stored in `<file>.md5`, if there is one
pub fn read_checksum(path: &Path) -> Result<Option<String>, ChecksumError> {
    let checksum_path = sidecar_path(path, MD5_EXTENSION);
    if !checksum_path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(checksum_path)?;
    Ok(text.split_whitespace().next().map(|s| s.to_lowercase()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSummary {
    pub processed: usize,
    pub skipped: usize,
}

/// Give every file under `start` whose name ends in one of `extensions` an MD5 sidecar.
/// Files that already have one, or are held open elsewhere, are skipped.
pub fn process_tree(
    start: &Path,
    extensions: &[&str],
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<TreeSummary, ChecksumError> {
    let mut targets = Vec::new();
    for entry in WalkDir::new(start).sort_by_file_name() {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy();
        if entry.file_type().is_file() && extensions.iter().any(|ext| name.ends_with(ext)) {
            targets.push(entry.into_path());
        }
    }

    let mut summary = TreeSummary::default();
    let total = targets.len();
    for (idx, path) in targets.iter().enumerate() {
        let item = path.to_string_lossy();
        if sidecar_path(path, MD5_EXTENSION).exists() {
            log::info!("{item}, checksum already exists, skipping!");
            summary.skipped += 1;
        } else if is_file_locked(path) {
            log::warn!("{item} is currently in use by another process, skipping!");
            summary.skipped += 1;
        } else {
            log::info!("Processing {item}");
            let digest = compute_md5(path, DEFAULT_MD5_BUFFER)?;
            write_checksum(path, &digest)?;
            summary.processed += 1;
        }
        tx.send(WorkerStatus::new(
            (idx + 1) as f32 / total as f32,
            &item,
            *worker_id,
            Phase::Hash,
        ))?;
    }

    if total == 0 {
        log::info!("No files found with the specified extensions.");
    } else {
        log::info!(
            "Processed {} files, skipped {} files.",
            summary.processed,
            summary.skipped
        );
    }
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdfHeaderInfo {
    pub patient: String,
    pub recording: String,
    pub start_date: String,
    pub num_signals: usize,
    pub duration_seconds: f64,
}

/// Contents of a `.shalog` file: one hash for the EDF header and one per fixed-size chunk
/// of the data that follows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkHashLog {
    pub filename: String,
    pub hash_algorithm: String,
    pub chunk_size_bytes: usize,
    pub header_size_bytes: usize,
    pub header_hash: String,
    pub edf_header_info: EdfHeaderInfo,
    pub chunk_hashes: Vec<String>,
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn compute_chunk_hashes(path: &Path, chunk_size: usize) -> Result<ChunkHashLog, ChecksumError> {
    let reader = EdfReader::open(path)?;
    let header = reader.header();
    let header_size = header.header_bytes;
    let edf_header_info = EdfHeaderInfo {
        patient: header.patient.clone(),
        recording: header.recording.clone(),
        start_date: header.start.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))?,
        num_signals: header.signals.len(),
        duration_seconds: header.duration_secs(),
    };

    let mut file = BufReader::new(File::open(path)?);
    let mut header_bytes = vec![0u8; header_size];
    let read = read_full(&mut file, &mut header_bytes)?;
    let header_hash = sha256_hex(&header_bytes[..read]);

    let mut chunk_hashes = Vec::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];
    loop {
        let read = read_full(&mut file, &mut chunk)?;
        if read == 0 {
            break;
        }
        chunk_hashes.push(sha256_hex(&chunk[..read]));
    }

    Ok(ChunkHashLog {
        filename: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        hash_algorithm: String::from(SHA256_NAME),
        chunk_size_bytes: chunk.len(),
        header_size_bytes: header_size,
        header_hash,
        edf_header_info,
        chunk_hashes,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkProblem {
    Mismatch,
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub header_mismatch: bool,
    pub chunk_mismatches: Vec<(usize, ChunkProblem)>,
    pub total_chunks: usize,
    /// Bytes present after the last logged chunk
    pub trailing_bytes: u64,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        !self.header_mismatch && self.chunk_mismatches.is_empty() && self.trailing_bytes == 0
    }
}

pub fn verify_against_log(path: &Path, log: &ChunkHashLog) -> Result<VerifyReport, ChecksumError> {
    if !log.hash_algorithm.eq_ignore_ascii_case(SHA256_NAME) {
        return Err(ChecksumError::UnsupportedAlgorithm(log.hash_algorithm.clone()));
    }
    let actual_header = EdfReader::open(path)?.header().header_bytes;
    if actual_header != log.header_size_bytes {
        return Err(ChecksumError::HeaderSizeMismatch {
            expected: log.header_size_bytes,
            actual: actual_header,
        });
    }

    let mut report = VerifyReport {
        total_chunks: log.chunk_hashes.len(),
        ..Default::default()
    };
    let mut file = BufReader::new(File::open(path)?);
    let mut header_bytes = vec![0u8; log.header_size_bytes];
    let read = read_full(&mut file, &mut header_bytes)?;
    report.header_mismatch = sha256_hex(&header_bytes[..read]) != log.header_hash;

    let mut chunk = vec![0u8; log.chunk_size_bytes.max(1)];
    for (idx, expected) in log.chunk_hashes.iter().enumerate() {
        let read = read_full(&mut file, &mut chunk)?;
        if read == 0 {
            report.chunk_mismatches.push((idx, ChunkProblem::Missing));
            return Ok(report);
        }
        if sha256_hex(&chunk[..read]) != *expected {
            report.chunk_mismatches.push((idx, ChunkProblem::Mismatch));
        }
    }
    report.trailing_bytes = std::io::copy(&mut file, &mut std::io::sink())?;
    Ok(report)
}

#[derive(Debug, Clone, PartialEq)]
pub enum HashOutcome {
    Written(PathBuf),
    Verified(VerifyReport),
}

/// Verify `path` against its `.shalog` when one exists, otherwise (or when forced)
/// write a fresh log.
pub fn hash_or_verify(path: &Path, force: bool) -> Result<HashOutcome, ChecksumError> {
    let log_path = sidecar_path(path, SHALOG_EXTENSION);
    if log_path.exists() && !force {
        log::info!("Found existing SHA log: {}", log_path.display());
        let log: ChunkHashLog = serde_json::from_str(&std::fs::read_to_string(&log_path)?)?;
        let report = verify_against_log(path, &log)?;
        if report.header_mismatch {
            log::warn!("Header mismatch.");
        } else {
            log::info!("Header matches.");
        }
        if report.chunk_mismatches.is_empty() {
            log::info!("All {} chunks match.", report.total_chunks);
        } else {
            log::warn!("{} chunk mismatches:", report.chunk_mismatches.len());
            for (idx, problem) in report.chunk_mismatches.iter() {
                log::warn!("  - Chunk {idx}: {problem:?}");
            }
        }
        if report.trailing_bytes > 0 {
            log::warn!("{} bytes follow the last logged chunk", report.trailing_bytes);
        }
        return Ok(HashOutcome::Verified(report));
    }

    log::info!("Generating SHA log for: {}", path.display());
    let log = compute_chunk_hashes(path, DEFAULT_HASH_CHUNK)?;
    let file = std::io::BufWriter::new(File::create(&log_path)?);
    serde_json::to_writer_pretty(file, &log)?;
    log::info!("SHA log saved to: {}", log_path.display());
    Ok(HashOutcome::Written(log_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf_header::tests::eeg_signal;
    use crate::edf_writer::{EdfWriter, WriterSetup};
    use std::sync::mpsc;
    use time::macros::datetime;

    fn write_edf(path: &Path, records: usize) {
        let setup = WriterSetup::new(
            "X X X X",
            "Startdate X X X X",
            datetime!(2021-08-09 07:06:05),
            1.0,
            vec![eeg_signal("EEG Pz", 500)],
        );
        let mut writer = EdfWriter::create(path, setup).unwrap();
        for r in 0..records {
            writer.write_record(&[&[r as i16; 500]]).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_md5_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let digest = compute_md5(&path, 4).unwrap();
        assert_eq!(digest, "5eb63bbbe01eeed093cb22bb8f5acdc3");

        let written = write_checksum(&path, &digest).unwrap();
        assert_eq!(written, dir.path().join("hello.txt.md5"));
        assert_eq!(read_checksum(&path).unwrap(), Some(digest));
    }

    #[test]
    fn test_process_tree_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("deep")).unwrap();
        std::fs::write(dir.path().join("a.edf"), b"a").unwrap();
        std::fs::write(dir.path().join("deep").join("b.RAR"), b"b").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"c").unwrap();
        std::fs::write(dir.path().join("a.edf.md5"), b"old").unwrap();

        let (tx, _rx) = mpsc::channel();
        let summary = process_tree(dir.path(), &MD5_TARGET_EXTENSIONS, &tx, &0).unwrap();
        assert_eq!(
            summary,
            TreeSummary {
                processed: 1,
                skipped: 1
            }
        );
        assert!(dir.path().join("deep").join("b.RAR.md5").exists());
        assert!(!dir.path().join("c.txt.md5").exists());
        assert_eq!(std::fs::read(dir.path().join("a.edf.md5")).unwrap(), b"old");
    }

    #[test]
    fn test_shalog_round() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 3);

        let outcome = hash_or_verify(&path, false).unwrap();
        assert_eq!(
            outcome,
            HashOutcome::Written(dir.path().join("rec.edf.shalog"))
        );
        let log: ChunkHashLog = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("rec.edf.shalog")).unwrap(),
        )
        .unwrap();
        assert_eq!(log.header_size_bytes, 768);
        assert_eq!(log.edf_header_info.start_date, "2021-08-09 07:06:05");
        assert_eq!(log.edf_header_info.duration_seconds, 3.0);
        // 3 records of 1138 bytes fit in one 100 KiB chunk
        assert_eq!(log.chunk_hashes.len(), 1);

        match hash_or_verify(&path, false).unwrap() {
            HashOutcome::Verified(report) => assert!(report.is_clean()),
            other => panic!("expected verification, got {other:?}"),
        }
    }

    #[test]
    fn test_verify_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 4);
        let log = compute_chunk_hashes(&path, 1000).unwrap();
        let total = log.chunk_hashes.len();

        let original = std::fs::read(&path).unwrap();
        let mut changed = original.clone();
        changed[768 + 1500] ^= 0xFF;
        changed.extend_from_slice(b"tail");
        std::fs::write(&path, &changed).unwrap();
        let report = verify_against_log(&path, &log).unwrap();
        assert!(!report.header_mismatch);
        // chunk 1 is modified, the last chunk now holds 4 extra bytes
        assert_eq!(report.chunk_mismatches[0], (1, ChunkProblem::Mismatch));
        assert_eq!(report.chunk_mismatches.len(), 2);
        assert_eq!(report.trailing_bytes, 0);

        let mut header_changed = original.clone();
        header_changed[10] = b'Z';
        header_changed.truncate(768 + 2000);
        std::fs::write(&path, &header_changed).unwrap();
        let report = verify_against_log(&path, &log).unwrap();
        assert!(report.header_mismatch);
        assert_eq!(
            report.chunk_mismatches.last(),
            Some(&(2, ChunkProblem::Missing))
        );
        assert_eq!(report.total_chunks, total);
    }

    #[test]
    fn test_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 2);
        // data is 2 * 1138 = 2276 bytes: chunks of 1138 divide it exactly
        let log = compute_chunk_hashes(&path, 1138).unwrap();
        assert_eq!(log.chunk_hashes.len(), 2);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&[0u8; 1138]);
        std::fs::write(&path, &bytes).unwrap();
        let report = verify_against_log(&path, &log).unwrap();
        assert!(report.chunk_mismatches.is_empty());
        assert_eq!(report.trailing_bytes, 1138);
        assert!(!report.is_clean());
    }
}
