use byteorder::{LittleEndian, ReadBytesExt};
use human_bytes::human_bytes;
use std::fmt::Display;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use super::checksum::{compute_md5, read_checksum, write_checksum};
use super::constants::*;
use super::error::ArchiveError;
use super::resident::is_file_locked;

/// Name of the list written by the folder scanner
pub const MATCHING_FOLDERS_FILE: &str = "matching_folders.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
}

/// An external archive tool able to list and extract single entries
pub trait Archiver {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError>;
    /// Extract `entry` flat into `dest`, returning the extracted path
    fn extract(&self, archive: &Path, entry: &str, dest: &Path) -> Result<PathBuf, ArchiveError>;
}

/// The `7z` command line tool, which reads both rar and 7z archives
#[derive(Debug, Clone)]
pub struct SevenZipCli {
    program: PathBuf,
}

impl SevenZipCli {
    pub fn new(program: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
        }
    }

    fn run(&self, args: &[&std::ffi::OsStr]) -> Result<String, ArchiveError> {
        let output = Command::new(&self.program).args(args).output()?;
        if !output.status.success() {
            return Err(ArchiveError::ArchiverFailed {
                program: self.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Archiver for SevenZipCli {
    fn list(&self, archive: &Path) -> Result<Vec<ArchiveEntry>, ArchiveError> {
        let listing = self.run(&["l".as_ref(), "-slt".as_ref(), archive.as_os_str()])?;
        parse_slt_listing(&listing)
    }

    fn extract(&self, archive: &Path, entry: &str, dest: &Path) -> Result<PathBuf, ArchiveError> {
        let mut out_flag = std::ffi::OsString::from("-o");
        out_flag.push(dest.as_os_str());
        self.run(&[
            "e".as_ref(),
            archive.as_os_str(),
            out_flag.as_os_str(),
            "-y".as_ref(),
            entry.as_ref(),
        ])?;
        let name = Path::new(entry)
            .file_name()
            .ok_or_else(|| ArchiveError::MissingEntry {
                archive: archive.to_path_buf(),
                entry: entry.to_string(),
            })?;
        Ok(dest.join(name))
    }
}

/// Parse the technical listing (`7z l -slt`). Entries follow the `----------` line as
/// blank-line separated `Key = Value` blocks; folders are left out.
pub fn parse_slt_listing(listing: &str) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let Some((_, body)) = listing.split_once("----------") else {
        return Err(ArchiveError::BadListing(String::from(
            "no entry separator in listing",
        )));
    };

    let mut entries = Vec::new();
    let mut name: Option<String> = None;
    let mut size: Option<u64> = None;
    let mut is_folder = false;
    let mut flush = |name: &mut Option<String>, size: &mut Option<u64>, is_folder: &mut bool| {
        if let Some(n) = name.take() {
            if !*is_folder {
                entries.push(ArchiveEntry {
                    name: n,
                    size: size.unwrap_or(0),
                });
            }
        }
        *size = None;
        *is_folder = false;
    };

    for line in body.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            flush(&mut name, &mut size, &mut is_folder);
            continue;
        }
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        match key {
            "Path" => name = Some(value.to_string()),
            "Size" => {
                size = Some(value.trim().parse().map_err(|_| {
                    ArchiveError::BadListing(format!("bad size {value:?}"))
                })?)
            }
            "Folder" => is_folder = value.trim() == "+",
            "Attributes" => is_folder |= value.starts_with('D'),
            _ => (),
        }
    }
    flush(&mut name, &mut size, &mut is_folder);
    Ok(entries)
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// First `<stem>*.rar` next to `edf`
fn find_archive(edf: &Path) -> Result<Option<PathBuf>, ArchiveError> {
    let Some(parent) = edf.parent() else {
        return Ok(None);
    };
    let stem = file_stem(edf);
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(parent)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && has_extension(p, "rar") && file_name(p).starts_with(&stem))
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    Equal,
    Diff,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifySummary {
    pub equal: usize,
    pub diff: usize,
    pub skipped: usize,
}

/// Compare the MD5 of an archived EDF with the digest of the original and leave
/// `<stem>.equal`/`<stem>.diff` (and `<stem>.confirm_equal`) beside the EDF.
pub fn verify_archive(
    archiver: &dyn Archiver,
    archive: &Path,
    edf: &Path,
    expected_md5: &str,
    temp_dir: &Path,
) -> Result<VerifyState, ArchiveError> {
    let edf_name = file_name(edf);
    let folder = edf.parent().unwrap_or(Path::new("."));
    let stem = file_stem(edf);
    log::info!("Working on file <{}>", archive.display());

    std::fs::create_dir_all(temp_dir)?;
    let extracted = archiver.extract(archive, &edf_name, temp_dir)?;
    log::info!("Extracted {edf_name} to {}", extracted.display());
    let calculated = compute_md5(&extracted, DEFAULT_MD5_BUFFER)?;
    log::info!("Calculated MD5 for {edf_name} in {}: {calculated}", archive.display());
    log::info!("Original MD5 from .md5 file: {expected_md5}");

    let state = if calculated.eq_ignore_ascii_case(expected_md5) {
        VerifyState::Equal
    } else {
        VerifyState::Diff
    };
    let (extension, word) = match state {
        VerifyState::Equal => (EQUAL_EXTENSION, "match"),
        VerifyState::Diff => (DIFF_EXTENSION, "mismatch"),
    };
    std::fs::write(
        folder.join(format!("{stem}.{extension}")),
        format!(
            "MD5 calculated after extracting from RAR = {calculated}, Original md5 calculated from uncompressed file = {expected_md5}"
        ),
    )?;
    log::info!("Checksums {word} for {edf_name} in {}.", archive.display());
    std::fs::remove_file(&extracted)?;

    if state == VerifyState::Equal {
        std::fs::write(
            folder.join(format!("{stem}.{CONFIRM_EQUAL_EXTENSION}")),
            format!("MD5 Calc = {calculated}, Saved = {expected_md5}"),
        )?;
    }
    Ok(state)
}

/// Verify every EDF below `folder` that has a `<stem>*.rar` archive beside it
pub fn verify_folder(
    folder: &Path,
    archiver: &dyn Archiver,
    temp_dir: &Path,
) -> Result<VerifySummary, ArchiveError> {
    let mut summary = VerifySummary::default();
    let edfs: Vec<PathBuf> = WalkDir::new(folder)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && has_extension(e.path(), "edf"))
        .map(|e| e.into_path())
        .collect();

    for edf in edfs.iter() {
        if is_file_locked(edf) {
            log::info!("File <{}> is being used, skipping...", edf.display());
            summary.skipped += 1;
            continue;
        }
        let digest = match read_checksum(edf)? {
            Some(digest) => digest,
            None => {
                log::info!("Calculating checksum md5 {}", edf.display());
                let digest = compute_md5(edf, DEFAULT_MD5_BUFFER)?;
                write_checksum(edf, &digest)?;
                digest
            }
        };
        let Some(archive) = find_archive(edf)? else {
            continue;
        };

        let entries = archiver.list(&archive)?;
        let edf_entries = entries
            .iter()
            .filter(|e| e.name.to_lowercase().ends_with(".edf"))
            .count();
        if edf_entries > 1 {
            log::error!("Multiple EDF files found in {}. Skipping.", archive.display());
            summary.skipped += 1;
            continue;
        }
        let edf_name = file_name(edf);
        if !entries.iter().any(|e| file_name(Path::new(&e.name)) == edf_name) {
            log::error!("{edf_name} not found in {}.", archive.display());
            summary.skipped += 1;
            continue;
        }

        match verify_archive(archiver, &archive, edf, &digest, temp_dir)? {
            VerifyState::Equal => summary.equal += 1,
            VerifyState::Diff => summary.diff += 1,
        }
    }
    Ok(summary)
}

/// Delete `<stem>.edf` and `<stem>.confirm_equal` wherever `<stem>.edf.rar`,
/// `<stem>.equal` and `<stem>.confirm_equal` all exist. Returns what was (or with
/// `dry_run`, would be) deleted.
pub fn purge_folder(folder: &Path, dry_run: bool) -> Result<Vec<PathBuf>, ArchiveError> {
    log::info!("Starting processing in folder: {}", folder.display());
    let mut deleted = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy();
        if !entry.file_type().is_file() || !name.ends_with(".edf") {
            continue;
        }
        let edf = entry.path();
        let dir = edf.parent().unwrap_or(folder);
        let stem = file_stem(edf);
        let archive = dir.join(format!("{stem}.edf.rar"));
        let equal = dir.join(format!("{stem}.{EQUAL_EXTENSION}"));
        let confirmed = dir.join(format!("{stem}.{CONFIRM_EQUAL_EXTENSION}"));
        if !(archive.is_file() && equal.is_file() && confirmed.is_file()) {
            continue;
        }

        for target in [edf.to_path_buf(), confirmed] {
            if dry_run {
                log::info!("Would delete: {}", target.display());
                deleted.push(target);
                continue;
            }
            match std::fs::remove_file(&target) {
                Ok(()) => {
                    log::info!("Deleted: {}", target.display());
                    deleted.push(target);
                }
                Err(e) => log::error!("Error deleting {}: {e}", target.display()),
            }
        }
    }
    log::info!("Processing completed for folder: {}", folder.display());
    Ok(deleted)
}

/// Whether `folder` directly holds a file ending in each of `extensions`
fn folder_contains_all(folder: &Path, extensions: &[&str]) -> Result<bool, ArchiveError> {
    let mut found = vec![false; extensions.len()];
    for entry in std::fs::read_dir(folder)? {
        let name = entry?.file_name().to_string_lossy().to_lowercase();
        for (flag, ext) in found.iter_mut().zip(extensions) {
            if name.ends_with(&ext.to_lowercase()) {
                *flag = true;
            }
        }
    }
    Ok(found.iter().all(|f| *f))
}

pub fn find_folders_with_extensions(
    root: &Path,
    extensions: &[&str],
) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut matching = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() && folder_contains_all(entry.path(), extensions)? {
            matching.push(entry.into_path());
        }
    }
    Ok(matching)
}

/// One pass of the archive scanner: verify every folder below `roots` holding both
/// EDF and rar files, then list them in `list_path`.
pub fn scan_and_verify(
    roots: &[PathBuf],
    archiver: &dyn Archiver,
    temp_dir: &Path,
    list_path: &Path,
) -> Result<Vec<PathBuf>, ArchiveError> {
    let mut matching = Vec::new();
    for root in roots {
        for folder in find_folders_with_extensions(root, &[".rar", ".edf"])? {
            log::info!("Found all extensions in {}, validating...", folder.display());
            verify_folder(&folder, archiver, temp_dir)?;
            matching.push(folder);
        }
    }
    if matching.is_empty() {
        log::info!("No matching folders found.");
    } else {
        let lines: Vec<String> = matching
            .iter()
            .map(|f| format!("{}\n", f.display()))
            .collect();
        std::fs::write(list_path, lines.concat())?;
        log::info!(
            "Found {} folders with all required extensions. Results saved to {}.",
            matching.len(),
            list_path.display()
        );
    }
    Ok(matching)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeTotals {
    pub compressed: u64,
    pub uncompressed: u64,
}

impl SizeTotals {
    pub fn ratio(&self) -> Option<f64> {
        match self.uncompressed {
            0 => None,
            u => Some(self.compressed as f64 / u as f64),
        }
    }
}

impl Display for SizeTotals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Uncompressed Size (incl. expanded archives): {}",
            human_bytes(self.uncompressed as f64)
        )?;
        write!(
            f,
            "Compressed Archive Size: {}",
            human_bytes(self.compressed as f64)
        )?;
        if let Some(ratio) = self.ratio() {
            write!(
                f,
                "\nCompression ratio: {ratio:.4} ({:.2}% space saving)",
                (1.0 - ratio) * 100.0
            )?;
        }
        Ok(())
    }
}

/// Uncompressed size stored in the gzip ISIZE trailer (modulo 2^32)
pub fn gzip_uncompressed_size(path: &Path) -> Result<u64, ArchiveError> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-4))?;
    Ok(file.read_u32::<LittleEndian>()? as u64)
}

/// Total on-disk size of `path` next to the size it would take with every archive expanded
pub fn analyze_folder(path: &Path, archiver: &dyn Archiver) -> Result<SizeTotals, ArchiveError> {
    let mut totals = SizeTotals::default();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file = entry.path();
        let size = entry.metadata()?.len();
        let extension = file
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let expanded = match extension.as_str() {
            "gz" => gzip_uncompressed_size(file),
            "rar" | "7z" => archiver
                .list(file)
                .map(|entries| entries.iter().map(|e| e.size).sum()),
            _ => Ok(size),
        };
        match expanded {
            Ok(expanded) => {
                totals.compressed += size;
                totals.uncompressed += expanded;
            }
            Err(e) => log::error!("Error processing {}: {e}", file.display()),
        }
    }
    Ok(totals)
}
