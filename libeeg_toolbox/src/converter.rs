//! Resident controller driving an external EDF exporter over a folder of recording
//! sessions.
//!
//! Every session folder in the input folder is handled once. A session whose UUID already
//! appears in an output EDF is archived under `skipped sessions`. Otherwise the exporter
//! runs while the expected output is watched: an export whose output stops growing, or
//! that starts producing numbered copies (`<uuid>(1).edf`), is killed. The session folder
//! then moves to `completed` (with a provenance note) or `errors` (with a note naming the
//! failure), and its name is appended to the processed list.
use fxhash::FxHashSet;
use regex::Regex;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use super::config::ConverterConfig;
use super::error::ConverterError;
use super::resident::move_path;
use super::timecalc::{file_timestamp, log_timestamp};

pub const SKIP_DIR: &str = "skipped sessions";
pub const COMPLETE_DIR: &str = "completed";
pub const ERROR_DIR: &str = "errors";

const UUID_PATTERN: &str =
    r"(?i)[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}";
const RELEASE_TIMEOUT: Duration = Duration::from_secs(60);

/// UUID part of a session folder name, or the whole name when there is none.
/// e.g. `sub-080_X~ X_1d395e3c-11ea-4b8f-ba48-3b8dc56c8151` -> `1d395e3c-11ea-4b8f-ba48-3b8dc56c8151`
pub fn session_base(folder_name: &str) -> String {
    Regex::new(UUID_PATTERN)
        .ok()
        .and_then(|re| re.find(folder_name).map(|m| m.as_str().to_string()))
        .unwrap_or_else(|| folder_name.to_string())
}

/// First `.edf` in `folder` whose name contains `base` (case-insensitive)
pub fn find_matching_edf(folder: &Path, base: &str) -> Result<Option<String>, ConverterError> {
    let base = base.to_lowercase();
    let mut names: Vec<String> = std::fs::read_dir(folder)?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| {
            let lower = n.to_lowercase();
            lower.ends_with(".edf") && lower.contains(&base)
        })
        .collect();
    names.sort();
    Ok(names.into_iter().next())
}

/// Whether the exporter has started writing numbered duplicates of `base`
fn has_replication(folder: &Path, base: &str) -> Result<bool, ConverterError> {
    let pattern = Regex::new(&format!(r"(?i){}\(\d+\)\.edf$", regex::escape(base)))?;
    for entry in std::fs::read_dir(folder)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if pattern.is_match(&name) {
            log::warn!("Replication issue detected: '{name}'");
            return Ok(true);
        }
    }
    Ok(false)
}

/// Wait until a file can be created in `folder`, i.e. nothing holds it any more
fn wait_for_release(folder: &Path, timeout: Duration) -> bool {
    let probe = folder.join("__probe__.tmp");
    let start = Instant::now();
    while start.elapsed() < timeout {
        if std::fs::write(&probe, b"probe").is_ok() && std::fs::remove_file(&probe).is_ok() {
            return true;
        }
        std::thread::sleep(Duration::from_secs(1));
    }
    false
}

pub fn read_processed_list(path: &Path) -> Result<FxHashSet<String>, ConverterError> {
    if !path.exists() {
        return Ok(FxHashSet::default());
    }
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect())
}

fn append_to_processed_list(path: &Path, folder_name: &str) -> Result<(), ConverterError> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{folder_name}")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportWatch {
    Finished,
    Stalled,
    Replicated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionOutcome {
    AlreadyProcessed,
    /// An EDF for the session was already present
    Skipped(String),
    Completed(String),
    Stalled,
    Replicated,
    MissingOutput,
    Failed(String),
}

pub struct Converter {
    config: ConverterConfig,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    fn kill(child: &mut Child) {
        if let Err(e) = child.kill() {
            log::error!("Could not kill exporter: {e}");
        }
        if let Err(e) = child.wait() {
            log::error!("Could not reap exporter: {e}");
        }
    }

    /// Watch the exporter until it exits, killing it when the output stalls or duplicates
    pub fn watch_export(
        &self,
        child: &mut Child,
        expected: &Path,
        base: &str,
    ) -> Result<ExportWatch, ConverterError> {
        let interval = self.config.monitor_interval();
        let window = self.config.stall_window();
        let min_growth = self.config.min_growth_per_check();
        let mut previous = 0u64;
        let mut stagnant = Duration::ZERO;

        loop {
            if let Some(status) = child.try_wait()? {
                if !status.success() {
                    log::warn!("Exporter exited with {status}");
                }
                return Ok(ExportWatch::Finished);
            }
            std::thread::sleep(interval);

            if has_replication(&self.config.output_folder, base)? {
                Self::kill(child);
                return Ok(ExportWatch::Replicated);
            }
            let Ok(metadata) = std::fs::metadata(expected) else {
                continue;
            };
            let size = metadata.len();
            let growth = size.saturating_sub(previous);
            previous = size;
            if growth < min_growth {
                stagnant += interval;
                if stagnant >= window {
                    log::warn!("Low activity on {}. Terminating process.", expected.display());
                    Self::kill(child);
                    return Ok(ExportWatch::Stalled);
                }
            } else {
                stagnant = Duration::ZERO;
            }
        }
    }

    /// Move a session folder under `archive_folder/<sub>`; an empty folder is left there
    /// when the move fails so the session is still visible
    fn archive(&self, source: &Path, sub: &str, folder_name: &str) -> Result<PathBuf, ConverterError> {
        let dest = self.config.archive_folder.join(sub).join(folder_name);
        if let Err(e) = move_path(source, &dest) {
            log::error!("Could not move {} to {}: {e}", source.display(), dest.display());
            std::fs::create_dir_all(&dest)?;
        }
        Ok(dest)
    }

    fn archive_error(
        &self,
        source: &Path,
        folder_name: &str,
        note_prefix: &str,
        note: &str,
    ) -> Result<(), ConverterError> {
        let dest = self.archive(source, ERROR_DIR, folder_name)?;
        std::fs::write(
            dest.join(format!("{note_prefix}_{}.txt", file_timestamp()?)),
            format!("{note}\n"),
        )?;
        Ok(())
    }

    fn export(&self, source: &Path, folder_name: &str, base: &str) -> Result<ConversionOutcome, ConverterError> {
        let started = log_timestamp()?;
        let output = &self.config.output_folder;
        let expected = output.join(format!("{base}.edf"));
        log::info!(
            "Running: {} -s {} -t {} -o {}",
            self.config.exporter_path.display(),
            source.display(),
            self.config.template_path.display(),
            output.display()
        );
        let mut child = Command::new(&self.config.exporter_path)
            .arg("-s")
            .arg(source)
            .arg("-t")
            .arg(&self.config.template_path)
            .arg("-o")
            .arg(output)
            .spawn()?;

        let watched = match self.watch_export(&mut child, &expected, base) {
            Ok(watched) => watched,
            Err(e) => {
                Self::kill(&mut child);
                return Err(e);
            }
        };
        match watched {
            ExportWatch::Replicated => {
                log::error!("REPLICATION ISSUE: duplicate EDFs for '{folder_name}'");
                if expected.exists() {
                    let renamed = output.join(format!("{base}_replication_issue.edf"));
                    std::fs::rename(&expected, renamed)?;
                }
                if !wait_for_release(source, RELEASE_TIMEOUT) {
                    log::warn!("Timeout waiting for folder release: {}", source.display());
                }
                self.archive_error(
                    source,
                    folder_name,
                    "replication_issue",
                    "Replication issue detected: multiple EDF files found.",
                )?;
                Ok(ConversionOutcome::Replicated)
            }
            ExportWatch::Stalled => {
                log::error!("Export stalled for '{folder_name}'");
                self.archive_error(
                    source,
                    folder_name,
                    "stalled_export",
                    "Export process stalled with low activity or interruption.",
                )?;
                Ok(ConversionOutcome::Stalled)
            }
            ExportWatch::Finished => {
                let Some(edf) = find_matching_edf(output, base)? else {
                    log::error!("Exported but EDF file not found for '{folder_name}'");
                    self.archive_error(
                        source,
                        folder_name,
                        "missing_edf",
                        "EDF file not found after export process completed.",
                    )?;
                    return Ok(ConversionOutcome::MissingOutput);
                };
                let ended = log_timestamp()?;
                let dest = self.archive(source, COMPLETE_DIR, folder_name)?;
                std::fs::write(
                    dest.join(format!("conversion_provenance_{}.txt", file_timestamp()?)),
                    format!(
                        "Task started:   {started}\nTask ended:     {ended}\nSource folder:  {}\nEDF matched:    {edf}\nFolder name:    {folder_name}\n",
                        source.display()
                    ),
                )?;
                log::info!("COMPLETED: '{folder_name}' archived in '{COMPLETE_DIR}'");
                Ok(ConversionOutcome::Completed(edf))
            }
        }
    }

    /// Handle one session folder of the input folder
    pub fn run_conversion(
        &self,
        folder_name: &str,
        processed: &FxHashSet<String>,
    ) -> Result<ConversionOutcome, ConverterError> {
        if processed.contains(folder_name) {
            return Ok(ConversionOutcome::AlreadyProcessed);
        }
        let source = self.config.input_folder.join(folder_name);
        let base = session_base(folder_name);

        let outcome = match find_matching_edf(&self.config.output_folder, &base)? {
            Some(edf) => {
                log::info!("SKIP: Found existing EDF '{edf}' for '{folder_name}'");
                self.archive(&source, SKIP_DIR, folder_name)?;
                ConversionOutcome::Skipped(edf)
            }
            None => match self.export(&source, folder_name, &base) {
                Ok(outcome) => outcome,
                Err(e) => {
                    log::error!("UNEXPECTED ERROR for '{folder_name}': {e}");
                    if source.exists() {
                        self.archive_error(
                            &source,
                            folder_name,
                            "exception_error",
                            &format!("Unexpected error: {e}"),
                        )?;
                    }
                    ConversionOutcome::Failed(e.to_string())
                }
            },
        };
        append_to_processed_list(&self.config.processed_list, folder_name)?;
        Ok(outcome)
    }

    /// One pass over the input folder
    pub fn run_pass(&self) -> Result<Vec<(String, ConversionOutcome)>, ConverterError> {
        let processed = read_processed_list(&self.config.processed_list)?;
        let mut folders: Vec<String> = std::fs::read_dir(&self.config.input_folder)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        folders.sort();

        let mut outcomes = Vec::new();
        for folder in folders {
            let outcome = self.run_conversion(&folder, &processed)?;
            if outcome != ConversionOutcome::AlreadyProcessed {
                outcomes.push((folder, outcome));
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const UUID: &str = "1d395e3c-11ea-4b8f-ba48-3b8dc56c8151";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: ConverterConfig,
    }

    /// `script` is the body of a shell exporter called as `-s <session> -t <template> -o <out>`
    fn fixture(script: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["in", "out", "archive"] {
            std::fs::create_dir(root.join(sub)).unwrap();
        }
        let exporter = root.join("exporter.sh");
        std::fs::write(&exporter, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&exporter, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(root.join("template.exp"), b"template").unwrap();

        let session = root.join("in").join(format!("sub-080_X~ X_{UUID}"));
        std::fs::create_dir(&session).unwrap();
        std::fs::write(session.join(format!("{UUID}.edf")), b"exported").unwrap();

        let config = ConverterConfig {
            input_folder: root.join("in"),
            output_folder: root.join("out"),
            archive_folder: root.join("archive"),
            exporter_path: exporter,
            template_path: root.join("template.exp"),
            processed_list: root.join("processed.txt"),
            interval_secs: 1,
            stall_mb_per_min: 10.0,
            monitor_interval_secs: 0.05,
            stall_window_secs: 0.2,
        };
        Fixture { _dir: dir, config }
    }

    fn session_name() -> String {
        format!("sub-080_X~ X_{UUID}")
    }

    #[test]
    fn test_session_base() {
        assert_eq!(session_base(&session_name()), UUID);
        assert_eq!(session_base("no uuid here"), "no uuid here");
    }

    #[test]
    fn test_successful_export() {
        let mut f = fixture(r#"cp "$2"/*.edf "$6"/"#);
        f.config.stall_window_secs = 5.0;
        f.config.validate().unwrap();
        let converter = Converter::new(f.config.clone());
        let outcomes = converter.run_pass().unwrap();
        assert_eq!(
            outcomes,
            vec![(
                session_name(),
                ConversionOutcome::Completed(format!("{UUID}.edf"))
            )]
        );
        let archived = f.config.archive_folder.join(COMPLETE_DIR).join(session_name());
        assert!(archived.is_dir());
        let provenance = std::fs::read_dir(&archived)
            .unwrap()
            .filter_map(|e| e.ok())
            .find(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("conversion_provenance_")
            })
            .unwrap();
        let note = std::fs::read_to_string(provenance.path()).unwrap();
        assert!(note.contains(&format!("EDF matched:    {UUID}.edf")));

        // processed folders are not picked up again
        assert!(converter.run_pass().unwrap().is_empty());
        assert_eq!(
            std::fs::read_to_string(&f.config.processed_list).unwrap(),
            format!("{}\n", session_name())
        );
    }

    #[test]
    fn test_existing_output_skips() {
        let f = fixture("exit 1");
        std::fs::write(
            f.config.output_folder.join(format!("X_{}.EDF", UUID.to_uppercase())),
            b"",
        )
        .unwrap();
        let converter = Converter::new(f.config.clone());
        let outcomes = converter.run_pass().unwrap();
        assert!(matches!(outcomes[0].1, ConversionOutcome::Skipped(_)));
        assert!(f
            .config
            .archive_folder
            .join(SKIP_DIR)
            .join(session_name())
            .is_dir());
    }

    #[test]
    fn test_missing_output_and_stall() {
        let f = fixture("exit 0");
        let converter = Converter::new(f.config.clone());
        let outcomes = converter.run_pass().unwrap();
        assert_eq!(outcomes[0].1, ConversionOutcome::MissingOutput);
        assert!(f
            .config
            .archive_folder
            .join(ERROR_DIR)
            .join(session_name())
            .is_dir());

        let f = fixture(r#"echo partial > "$6/1d395e3c-11ea-4b8f-ba48-3b8dc56c8151.edf"; sleep 30"#);
        let converter = Converter::new(f.config.clone());
        let started = Instant::now();
        let outcomes = converter.run_pass().unwrap();
        assert_eq!(outcomes[0].1, ConversionOutcome::Stalled);
        assert!(started.elapsed() < Duration::from_secs(20));
        let errors = f.config.archive_folder.join(ERROR_DIR).join(session_name());
        let notes: Vec<String> = std::fs::read_dir(&errors)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(notes.iter().any(|n| n.starts_with("stalled_export_")));
    }

    #[test]
    fn test_exporter_killed_when_watch_fails() {
        let f = fixture(r#"echo $$ > "$4.pid"; rm -rf "$6"; exec sleep 30"#);
        let converter = Converter::new(f.config.clone());
        let started = Instant::now();
        let outcomes = converter.run_pass().unwrap();
        assert!(matches!(outcomes[0].1, ConversionOutcome::Failed(_)));
        assert!(started.elapsed() < Duration::from_secs(20));

        let pid_file = PathBuf::from(format!("{}.pid", f.config.template_path.display()));
        let pid = std::fs::read_to_string(pid_file).unwrap();
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
        assert!(f
            .config
            .archive_folder
            .join(ERROR_DIR)
            .join(session_name())
            .is_dir());
    }
}
