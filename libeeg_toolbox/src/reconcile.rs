use fxhash::{FxHashMap, FxHashSet};
use glob::Pattern;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use walkdir::WalkDir;

use super::constants::PASS_EXTENSION;
use super::edf_reader::EdfReader;
use super::error::ReconcileError;
use super::resident::move_path;

/// Non-empty, trimmed lines of a list file
pub fn read_list(path: &Path) -> Result<Vec<String>, ReconcileError> {
    if !path.is_file() {
        return Err(ReconcileError::BadListFile(path.to_path_buf()));
    }
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderComparison {
    pub expected: usize,
    pub found: usize,
    pub missing_on_disk: Vec<String>,
    pub extras_on_disk: Vec<String>,
}

/// Compare the subfolders of `folder` with the names listed in `list`
pub fn compare_folder_with_list(
    folder: &Path,
    list: &Path,
) -> Result<FolderComparison, ReconcileError> {
    if !folder.is_dir() {
        return Err(ReconcileError::BadDirectory(folder.to_path_buf()));
    }
    let expected: FxHashSet<String> = read_list(list)?.into_iter().collect();
    let mut actual = FxHashSet::default();
    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            actual.insert(entry.file_name().to_string_lossy().to_string());
        }
    }

    let mut missing_on_disk: Vec<String> = expected.difference(&actual).cloned().collect();
    let mut extras_on_disk: Vec<String> = actual.difference(&expected).cloned().collect();
    missing_on_disk.sort();
    extras_on_disk.sort();
    Ok(FolderComparison {
        expected: expected.len(),
        found: actual.len(),
        missing_on_disk,
        extras_on_disk,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternMatches {
    pub found: Vec<String>,
    pub not_found: Vec<String>,
}

/// Check each list line against the entries of `base`. Lines may use wildcards; a
/// trailing `\` asks for a folder, anything else for a file.
pub fn match_patterns(patterns: &[String], base: &Path) -> Result<PatternMatches, ReconcileError> {
    if !base.is_dir() {
        return Err(ReconcileError::BadDirectory(base.to_path_buf()));
    }
    let mut candidates = Vec::new();
    for entry in std::fs::read_dir(base)? {
        let entry = entry?;
        candidates.push((
            entry.file_name().to_string_lossy().to_string(),
            entry.file_type()?.is_dir(),
        ));
    }

    let mut matches = PatternMatches::default();
    for raw in patterns {
        let wants_folder = raw.ends_with('\\');
        let pattern = Pattern::new(raw.trim_end_matches('\\'))?;
        let hit = candidates
            .iter()
            .any(|(name, is_dir)| *is_dir == wants_folder && pattern.matches(name));
        log::info!("Checking: '{raw}' ... {}", if hit { "Found" } else { "Not Found" });
        if hit {
            matches.found.push(raw.clone());
        } else {
            matches.not_found.push(raw.clone());
        }
    }
    Ok(matches)
}

fn is_bids_filename(name: &str) -> bool {
    ["sub-", "ses-", "task-", "run-"]
        .iter()
        .all(|part| name.contains(part))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    Delete(PathBuf),
    Move { from: PathBuf, to: PathBuf },
}

/// Sheet paths may have been written on Windows
fn sheet_path(value: &str) -> PathBuf {
    PathBuf::from(value.replace('\\', "/"))
}

/// Tidy the raw side after BIDS conversion, driven by a match sheet (CSV export with
/// `Filename A`, `Match Status`, `File A Relative Path` and `File B Relative Path`).
///
/// For every uniquely matched row whose `Filename A` is a BIDS name, the raw `.edf` is
/// deleted if it passed the compatibility check and the remaining files sharing its stem
/// move to `dest/<A parent + A stem, separators replaced by _>`.
pub fn cleanup_after_bids(
    sheet: &Path,
    source: &Path,
    dest: &Path,
    dry_run: bool,
) -> Result<Vec<CleanupAction>, ReconcileError> {
    if !sheet.is_file() {
        return Err(ReconcileError::BadListFile(sheet.to_path_buf()));
    }
    let mut reader = csv::Reader::from_path(sheet)?;
    let headers = reader.headers()?.clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or(ReconcileError::MissingColumn(name))
    };
    let filename_a = column("Filename A")?;
    let status = column("Match Status")?;
    let rel_a = column("File A Relative Path")?;
    let rel_b = column("File B Relative Path")?;

    let mut actions = Vec::new();
    for record in reader.records() {
        let record = record?;
        let name_a = record.get(filename_a).unwrap_or_default().trim();
        if name_a.is_empty() {
            continue;
        }
        let unique = record
            .get(status)
            .unwrap_or_default()
            .trim()
            .eq_ignore_ascii_case("unique match");
        if !unique || !is_bids_filename(name_a) {
            continue;
        }

        let file_b = source.join(sheet_path(record.get(rel_b).unwrap_or_default().trim()));
        log::info!("Full path = <{}>", file_b.display());
        let folder = file_b.parent().unwrap_or(source).to_path_buf();
        let base = file_b
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let edf = folder.join(format!("{base}.edf"));
        let passed = folder.join(format!("{base}.{PASS_EXTENSION}"));
        if edf.exists() && passed.exists() {
            if !dry_run {
                std::fs::remove_file(&edf)?;
            }
            log::info!("[DELETE] {}", edf.display());
            actions.push(CleanupAction::Delete(edf));
        }

        let bids_base = Path::new(name_a)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let a_parent = sheet_path(record.get(rel_a).unwrap_or_default().trim())
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let fold_out = a_parent
            .join(bids_base)
            .to_string_lossy()
            .replace(['/', '\\', '-'], "_");
        let dest_folder = dest.join(fold_out);
        if !dry_run {
            std::fs::create_dir_all(&dest_folder)?;
        }

        let pattern = format!(
            "{}/{}.*",
            Pattern::escape(&folder.to_string_lossy()),
            Pattern::escape(&base)
        );
        let mut siblings: Vec<PathBuf> = glob::glob(&pattern)?.collect::<Result<_, _>>()?;
        siblings.sort();
        for file in siblings {
            let is_edf = file
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("edf"));
            if is_edf {
                continue;
            }
            let Some(name) = file.file_name() else {
                continue;
            };
            let to = dest_folder.join(name);
            if !dry_run {
                move_path(&file, &to)?;
            }
            log::info!("[MOVE] {} -> {}", file.display(), to.display());
            actions.push(CleanupAction::Move { from: file, to });
        }
    }
    Ok(actions)
}

/// Identity of an EDF for duplicate detection: size, start to the second, duration to
/// the millisecond
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdfKey {
    pub size_bytes: u64,
    pub start: String,
    pub duration: String,
}

fn edf_key(path: &Path) -> Result<EdfKey, String> {
    let size_bytes = std::fs::metadata(path).map_err(|e| e.to_string())?.len();
    let reader = EdfReader::open(path).map_err(|e| e.to_string())?;
    let header = reader.header();
    let start = header
        .start
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]"
        ))
        .map_err(|e| e.to_string())?;
    Ok(EdfKey {
        size_bytes,
        start,
        duration: format!("{:.3}", header.duration_secs()),
    })
}

#[derive(Debug, Default)]
struct TreeKeys {
    paths: Vec<PathBuf>,
    by_key: FxHashMap<EdfKey, Vec<PathBuf>>,
    errors: Vec<(PathBuf, String)>,
}

fn scan_keys(root: &Path) -> Result<TreeKeys, ReconcileError> {
    let mut keys = TreeKeys::default();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let is_edf = entry.file_name().to_string_lossy().ends_with(".edf");
        if !entry.file_type().is_file() || !is_edf {
            continue;
        }
        let path = entry.into_path();
        match edf_key(&path) {
            Ok(key) => {
                keys.by_key.entry(key).or_default().push(path.clone());
                keys.paths.push(path);
            }
            Err(e) => {
                log::error!("{} :: {e}", path.display());
                keys.errors.push((path, e));
            }
        }
    }
    Ok(keys)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicatePair {
    pub raw: PathBuf,
    pub bids: PathBuf,
    pub key: EdfKey,
}

#[derive(Debug, Clone, Default)]
pub struct DuplicateReport {
    pub duplicate_keys: usize,
    /// Raw copies that passed the compatibility check and can go
    pub compliant: Vec<DuplicatePair>,
    /// Raw copies with a BIDS twin but no `.edf_pass`
    pub missing_pass: Vec<DuplicatePair>,
    /// Every raw EDF without `.edf_pass`
    pub raw_without_pass: Vec<PathBuf>,
    pub errors: Vec<(PathBuf, String)>,
}

/// Find raw EDFs (`raw_root`) that already exist in the BIDS tree (`bids_root`)
pub fn find_duplicates(bids_root: &Path, raw_root: &Path) -> Result<DuplicateReport, ReconcileError> {
    for root in [bids_root, raw_root] {
        if !root.is_dir() {
            return Err(ReconcileError::BadDirectory(root.to_path_buf()));
        }
    }
    let bids = scan_keys(bids_root)?;
    let raw = scan_keys(raw_root)?;

    let mut report = DuplicateReport::default();
    let mut has_pass = FxHashMap::default();
    for path in raw.paths.iter() {
        let pass = PathBuf::from(format!("{}_pass", path.display())).exists();
        has_pass.insert(path.clone(), pass);
        if !pass {
            report.raw_without_pass.push(path.clone());
        }
    }

    let mut common: Vec<&EdfKey> = raw
        .by_key
        .keys()
        .filter(|k| bids.by_key.contains_key(*k))
        .collect();
    common.sort();
    report.duplicate_keys = common.len();
    for key in common {
        let (Some(raw_paths), Some(bids_paths)) = (raw.by_key.get(key), bids.by_key.get(key))
        else {
            continue;
        };
        for raw_path in raw_paths {
            for bids_path in bids_paths {
                let pair = DuplicatePair {
                    raw: raw_path.clone(),
                    bids: bids_path.clone(),
                    key: key.clone(),
                };
                if has_pass.get(raw_path).copied().unwrap_or(false) {
                    report.compliant.push(pair);
                } else {
                    report.missing_pass.push(pair);
                }
            }
        }
    }
    report.errors = bids.errors.into_iter().chain(raw.errors).collect();
    Ok(report)
}

pub fn write_duplicate_report(report: &DuplicateReport, output: &Path) -> Result<(), ReconcileError> {
    let mut writer = csv::Writer::from_path(output)?;
    writer.write_record([
        "status",
        "stepb_path",
        "stepc_path",
        "size_bytes",
        "start_iso",
        "duration_sec_3dp",
        "note",
    ])?;
    let pair_rows = report
        .compliant
        .iter()
        .map(|p| ("compliant", p, ""))
        .chain(
            report
                .missing_pass
                .iter()
                .map(|p| ("warning_dup", p, "Missing .edf_pass sidecar")),
        );
    for (status, pair, note) in pair_rows {
        writer.write_record(&[
            status.to_string(),
            pair.raw.to_string_lossy().to_string(),
            pair.bids.to_string_lossy().to_string(),
            pair.key.size_bytes.to_string(),
            pair.key.start.clone(),
            pair.key.duration.clone(),
            note.to_string(),
        ])?;
    }
    for path in report.raw_without_pass.iter() {
        let path = path.to_string_lossy();
        writer.write_record([
            "warning_no_sidecar",
            path.as_ref(),
            "",
            "",
            "",
            "",
            "missing .edf_pass",
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf_header::tests::eeg_signal;
    use crate::edf_writer::{EdfWriter, WriterSetup};
    use time::macros::datetime;

    #[test]
    fn test_compare_folder() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        for name in ["sub-001", "sub-002", "sub-009"] {
            std::fs::create_dir_all(root.join(name)).unwrap();
        }
        std::fs::write(root.join("sub-003"), b"a file, not a folder").unwrap();
        let list = dir.path().join("list.txt");
        std::fs::write(&list, "sub-001\n\n  sub-002  \nsub-003\nsub-004\n").unwrap();

        let result = compare_folder_with_list(&root, &list).unwrap();
        assert_eq!(result.expected, 4);
        assert_eq!(result.found, 3);
        assert_eq!(result.missing_on_disk, vec!["sub-003", "sub-004"]);
        assert_eq!(result.extras_on_disk, vec!["sub-009"]);
    }

    #[test]
    fn test_match_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        std::fs::write(dir.path().join("rec_01.edf"), b"").unwrap();
        let patterns: Vec<String> = ["data\\", "data", "rec_*.edf", "rec_02.edf", "rec_01.edf\\"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = match_patterns(&patterns, dir.path()).unwrap();
        assert_eq!(result.found, vec!["data\\", "rec_*.edf"]);
        assert_eq!(result.not_found, vec!["data", "rec_02.edf", "rec_01.edf\\"]);
        assert!(match_patterns(&patterns, &dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_cleanup_after_bids() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("raw");
        let dest = dir.path().join("done");
        let session = source.join("Patient1").join("day1");
        std::fs::create_dir_all(&session).unwrap();
        for name in ["rec.edf", "rec.edf_pass", "rec.md5", "other.edf"] {
            std::fs::write(session.join(name), b"x").unwrap();
        }
        let sheet = dir.path().join("matches.csv");
        std::fs::write(
            &sheet,
            "Filename A,Filename B,Match Status,File A Relative Path,File B Relative Path\n\
             sub-01_ses-02_task-full_run-01_ieeg.edf,rec.edf,Unique Match,sub-01\\ses-02\\sub-01_ses-02_task-full_run-01_ieeg.edf,Patient1\\day1\\rec.edf\n\
             sub-01_ses-03_task-full_run-01_ieeg.edf,other.edf,multiple,sub-01/x.edf,Patient1/day1/other.edf\n\
             ,,unique match,,\n",
        )
        .unwrap();

        let folder = dest.join("sub_01_ses_02_sub_01_ses_02_task_full_run_01_ieeg");
        let planned = cleanup_after_bids(&sheet, &source, &dest, true).unwrap();
        assert_eq!(planned.len(), 3);
        assert_eq!(planned[0], CleanupAction::Delete(session.join("rec.edf")));
        assert!(session.join("rec.edf").exists());
        assert!(!dest.exists());

        let done = cleanup_after_bids(&sheet, &source, &dest, false).unwrap();
        assert_eq!(done, planned);
        assert!(!session.join("rec.edf").exists());
        assert!(folder.join("rec.edf_pass").exists());
        assert!(folder.join("rec.md5").exists());
        assert!(session.join("other.edf").exists());
    }

    fn write_edf(path: &Path, records: usize) {
        let setup = WriterSetup::new(
            "X X X X",
            "Startdate X X X X",
            datetime!(2022-01-02 03:04:05),
            1.0,
            vec![eeg_signal("EEG Fz", 100)],
        );
        let mut writer = EdfWriter::create(path, setup).unwrap();
        for _ in 0..records {
            writer.write_record(&[&[0; 100]]).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_find_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let bids = dir.path().join("bids");
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(&bids).unwrap();
        std::fs::create_dir_all(&raw).unwrap();
        write_edf(&bids.join("sub-01_run-01_ieeg.edf"), 3);
        write_edf(&raw.join("a.edf"), 3);
        write_edf(&raw.join("b.edf"), 3);
        write_edf(&raw.join("c.edf"), 4);
        std::fs::write(raw.join("a.edf_pass"), b"ok").unwrap();
        std::fs::write(raw.join("broken.edf"), b"nope").unwrap();

        let report = find_duplicates(&bids, &raw).unwrap();
        assert_eq!(report.duplicate_keys, 1);
        assert_eq!(report.compliant.len(), 1);
        assert_eq!(report.compliant[0].raw, raw.join("a.edf"));
        assert_eq!(report.compliant[0].key.start, "2022-01-02T03:04:05");
        assert_eq!(report.compliant[0].key.duration, "3.000");
        assert_eq!(report.missing_pass.len(), 1);
        assert_eq!(report.raw_without_pass.len(), 2);
        assert_eq!(report.errors.len(), 1);

        let csv_path = dir.path().join("report.csv");
        write_duplicate_report(&report, &csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        assert_eq!(text.lines().count(), 1 + 1 + 1 + 2);
        assert!(text.contains("warning_dup"));
    }
}
