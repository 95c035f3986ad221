//! One-way sync of a recording server share into a local repository, with a SQLite
//! ledger of what has been copied (`sync_log`) and every decision taken (`event_log`).
//!
//! Files are keyed by their path without the filesystem anchor, so a repository mirrors
//! the server layout below the drive/root.
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use std::fs::{File, FileTimes};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use time::macros::format_description;
use time::{Duration, OffsetDateTime};
use walkdir::WalkDir;

use super::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncThresholds {
    /// New files younger than this are left for a later pass
    pub copy_after: Duration,
    /// Files older than this are never synced
    pub ignore_after: Duration,
}

impl Default for SyncThresholds {
    fn default() -> Self {
        Self {
            copy_after: Duration::hours(36),
            ignore_after: Duration::days(4 * 365),
        }
    }
}

impl SyncThresholds {
    /// Event reason for a file past `ignore_after`, in years when it is a whole number of them
    pub fn ignore_reason(&self) -> String {
        let days = self.ignore_after.whole_days();
        if days > 0 && days % 365 == 0 {
            format!("file older than {} years", days / 365)
        } else {
            format!("file older than {days} days")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTable {
    Sync,
    Event,
}

impl LogTable {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync => "sync_log",
            Self::Event => "event_log",
        }
    }
}

fn iso(value: OffsetDateTime) -> Result<String, SyncError> {
    Ok(value.format(format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second]"
    ))?)
}

fn file_stamp(value: OffsetDateTime) -> Result<String, SyncError> {
    Ok(value.format(format_description!(
        "[year][month][day]_[hour][minute][second]"
    ))?)
}

/// `path` without its prefix and root, e.g. `/srv/a/b.erd` -> `srv/a/b.erd`
pub fn strip_anchor(path: &Path) -> Result<PathBuf, SyncError> {
    if !path.has_root() {
        return Err(SyncError::NoAnchor(path.to_path_buf()));
    }
    Ok(path
        .components()
        .filter(|c| !matches!(c, Component::Prefix(_) | Component::RootDir))
        .collect())
}

/// The prefix and root of `path`, e.g. `C:\` or `/`
fn anchor_of(path: &Path) -> PathBuf {
    path.components()
        .take_while(|c| matches!(c, Component::Prefix(_) | Component::RootDir))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub file_name: String,
    pub relative_path: String,
    pub size: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub accessed: SystemTime,
}

impl FileInfo {
    pub fn read(path: &Path) -> Result<Self, SyncError> {
        let metadata = std::fs::metadata(path)?;
        let modified = metadata.modified()?;
        Ok(Self {
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            relative_path: strip_anchor(path)?.to_string_lossy().to_string(),
            size: metadata.len(),
            // not every filesystem records a birth time
            created: metadata.created().unwrap_or(modified),
            modified,
            accessed: metadata.accessed().unwrap_or(modified),
        })
    }

    fn age(&self, now: OffsetDateTime) -> Duration {
        now - OffsetDateTime::from(self.created)
    }

    fn times(&self, now: OffsetDateTime) -> Result<[String; 3], SyncError> {
        let local = |t: SystemTime| iso(OffsetDateTime::from(t).to_offset(now.offset()));
        Ok([local(self.created)?, local(self.modified)?, local(self.accessed)?])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRow {
    pub timestamp: String,
    pub action: String,
    pub relative_path: String,
    pub size: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    pub copied: usize,
    pub skipped: usize,
    pub ignored: usize,
    pub conflicts: usize,
    pub conflict_report: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct UpdateRow {
    relative_path: String,
    #[serde(default)]
    action: String,
}

/// Copy `from` to `to` keeping its access and modification times
fn copy_with_times(from: &Path, to: &Path, info: &FileInfo) -> Result<(), SyncError> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(from, to)?;
    let times = FileTimes::new()
        .set_accessed(info.accessed)
        .set_modified(info.modified);
    File::options().write(true).open(to)?.set_times(times)?;
    Ok(())
}

pub struct SyncDb {
    conn: Connection,
}

impl SyncDb {
    pub fn open(path: &Path) -> Result<Self, SyncError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sync_log (
                relative_path TEXT PRIMARY KEY,
                file_name TEXT,
                size INTEGER,
                creation_time TEXT,
                modification_time TEXT,
                access_time TEXT
            );
            CREATE TABLE IF NOT EXISTS event_log (
                timestamp TEXT,
                action TEXT,
                relative_path TEXT,
                size INTEGER,
                reason TEXT
            );",
        )?;
        Ok(Self { conn })
    }

    fn log_event(
        &self,
        now: OffsetDateTime,
        action: &str,
        relative_path: &str,
        size: u64,
        reason: &str,
    ) -> Result<(), SyncError> {
        self.conn.execute(
            "INSERT INTO event_log (timestamp, action, relative_path, size, reason)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![iso(now)?, action, relative_path, size as i64, reason],
        )?;
        Ok(())
    }

    pub fn logged_size(&self, relative_path: &str) -> Result<Option<i64>, SyncError> {
        Ok(self
            .conn
            .query_row(
                "SELECT size FROM sync_log WHERE relative_path = ?1",
                params![relative_path],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn record_file(&self, info: &FileInfo, now: OffsetDateTime) -> Result<(), SyncError> {
        let [created, modified, accessed] = info.times(now)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO sync_log
             (relative_path, file_name, size, creation_time, modification_time, access_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                info.relative_path,
                info.file_name,
                info.size as i64,
                created,
                modified,
                accessed
            ],
        )?;
        Ok(())
    }

    pub fn events(&self) -> Result<Vec<EventRow>, SyncError> {
        let mut statement = self.conn.prepare(
            "SELECT timestamp, action, relative_path, size, reason FROM event_log ORDER BY rowid",
        )?;
        let rows = statement.query_map([], |row| {
            Ok(EventRow {
                timestamp: row.get(0)?,
                action: row.get(1)?,
                relative_path: row.get(2)?,
                size: row.get(3)?,
                reason: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    fn server_files(server: &Path) -> Result<Vec<PathBuf>, SyncError> {
        let root = server.canonicalize()?;
        let mut files = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }

    /// Copy new, settled files from `server` into `local`. Known files whose size changed
    /// are reported as conflicts in `sync_conflicts_<ts>.csv` under `report_dir`, never
    /// overwritten.
    pub fn sync_files(
        &self,
        server: &Path,
        local: &Path,
        thresholds: &SyncThresholds,
        report_dir: &Path,
        now: OffsetDateTime,
    ) -> Result<SyncSummary, SyncError> {
        let mut summary = SyncSummary::default();
        let mut conflicts: Vec<(FileInfo, i64)> = Vec::new();

        let ignore_reason = thresholds.ignore_reason();
        for source in Self::server_files(server)? {
            let info = FileInfo::read(&source)?;
            let relative = info.relative_path.as_str();
            let age = info.age(now);

            if age > thresholds.ignore_after {
                self.log_event(now, "ignored", relative, info.size, &ignore_reason)?;
                summary.ignored += 1;
                continue;
            }

            if let Some(logged) = self.logged_size(relative)? {
                if logged != info.size as i64 {
                    log::warn!("Size mismatch for {relative}: logged {logged}, now {}", info.size);
                    self.log_event(now, "conflict", relative, info.size, "size mismatch")?;
                    conflicts.push((info, logged));
                }
                continue;
            }

            if age > thresholds.copy_after {
                copy_with_times(&source, &local.join(relative), &info)?;
                self.record_file(&info, now)?;
                self.log_event(now, "copied", relative, info.size, "new file")?;
                log::info!("Copied {relative}");
                summary.copied += 1;
            } else {
                self.log_event(now, "skipped", relative, info.size, "file too new")?;
                summary.skipped += 1;
            }
        }

        summary.conflicts = conflicts.len();
        if !conflicts.is_empty() {
            let path = report_dir.join(format!("sync_conflicts_{}.csv", file_stamp(now)?));
            let mut writer = csv::Writer::from_path(&path)?;
            writer.write_record([
                "file_name",
                "relative_path",
                "size",
                "creation_time",
                "modification_time",
                "access_time",
                "logged_size",
                "action",
            ])?;
            for (info, logged) in conflicts.iter() {
                let [created, modified, accessed] = info.times(now)?;
                writer.write_record(&[
                    info.file_name.clone(),
                    info.relative_path.clone(),
                    info.size.to_string(),
                    created,
                    modified,
                    accessed,
                    logged.to_string(),
                    String::from("skip"),
                ])?;
            }
            writer.flush()?;
            log::warn!("{} conflicts written to {}", conflicts.len(), path.display());
            summary.conflict_report = Some(path);
        }
        Ok(summary)
    }

    /// Record every server file as already synced without copying anything
    pub fn assume_previously_synced(&self, server: &Path, now: OffsetDateTime) -> Result<usize, SyncError> {
        let files = Self::server_files(server)?;
        for source in files.iter() {
            let info = FileInfo::read(source)?;
            self.record_file(&info, now)?;
            self.log_event(now, "assume_synced", &info.relative_path, info.size, "initial snapshot")?;
        }
        Ok(files.len())
    }

    /// Apply the rows of a reviewed conflict sheet whose `action` is `update`
    pub fn update_differences(
        &self,
        sheet: &Path,
        server: &Path,
        local: &Path,
        now: OffsetDateTime,
    ) -> Result<usize, SyncError> {
        let anchor = anchor_of(&server.canonicalize()?);
        let mut reader = csv::Reader::from_path(sheet)?;
        let mut updated = 0;
        for row in reader.deserialize() {
            let row: UpdateRow = row?;
            if !row.action.trim().eq_ignore_ascii_case("update") {
                continue;
            }
            let source = anchor.join(&row.relative_path);
            let info = FileInfo::read(&source)?;
            copy_with_times(&source, &local.join(&row.relative_path), &info)?;
            self.record_file(&info, now)?;
            self.log_event(now, "updated", &info.relative_path, info.size, "manual update")?;
            updated += 1;
        }
        Ok(updated)
    }

    /// Dump a table to `<table>_<ts>.csv` in `out_dir`
    pub fn export_table(
        &self,
        table: LogTable,
        out_dir: &Path,
        now: OffsetDateTime,
    ) -> Result<PathBuf, SyncError> {
        let path = out_dir.join(format!("{}_{}.csv", table.name(), file_stamp(now)?));
        let mut statement = self
            .conn
            .prepare(&format!("SELECT * FROM {}", table.name()))?;
        let columns: Vec<String> = statement
            .column_names()
            .iter()
            .map(|c| c.to_string())
            .collect();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(&columns)?;

        let mut rows = statement.query([])?;
        while let Some(row) = rows.next()? {
            let mut cells = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                cells.push(match row.get_ref(idx)? {
                    ValueRef::Null => String::new(),
                    ValueRef::Integer(i) => i.to_string(),
                    ValueRef::Real(r) => r.to_string(),
                    ValueRef::Text(t) => String::from_utf8_lossy(t).to_string(),
                    ValueRef::Blob(b) => hex::encode(b),
                });
            }
            writer.write_record(&cells)?;
        }
        writer.flush()?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        server: PathBuf,
        local: PathBuf,
        reports: PathBuf,
        db: SyncDb,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let server = dir.path().join("server");
        let local = dir.path().join("local");
        let reports = dir.path().join("reports");
        std::fs::create_dir_all(server.join("Patient1")).unwrap();
        std::fs::create_dir_all(&reports).unwrap();
        std::fs::write(server.join("Patient1").join("a.erd"), b"12345").unwrap();
        std::fs::write(server.join("Patient1").join("a.eeg"), b"xy").unwrap();
        let db = SyncDb::open(&dir.path().join("sync.db")).unwrap();
        Fixture {
            server,
            local,
            reports,
            db,
            _dir: dir,
        }
    }

    fn relative(path: &Path) -> String {
        strip_anchor(&path.canonicalize().unwrap())
            .unwrap()
            .to_string_lossy()
            .to_string()
    }

    #[test]
    fn test_anchor() {
        assert_eq!(
            strip_anchor(Path::new("/srv/share/a.erd")).unwrap(),
            PathBuf::from("srv/share/a.erd")
        );
        assert!(strip_anchor(Path::new("relative/a.erd")).is_err());
        assert_eq!(anchor_of(Path::new("/srv/share")), PathBuf::from("/"));
    }

    #[test]
    fn test_young_files_wait() {
        let f = fixture();
        let now = OffsetDateTime::now_utc() + Duration::hours(1);
        let summary = f
            .db
            .sync_files(&f.server, &f.local, &SyncThresholds::default(), &f.reports, now)
            .unwrap();
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.copied, 0);
        assert!(!f.local.exists());
        let events = f.db.events().unwrap();
        assert!(events.iter().all(|e| e.action == "skipped" && e.reason == "file too new"));
    }

    #[test]
    fn test_settled_files_copied_once() {
        let f = fixture();
        let now = OffsetDateTime::now_utc() + Duration::hours(48);
        let thresholds = SyncThresholds::default();
        let summary = f
            .db
            .sync_files(&f.server, &f.local, &thresholds, &f.reports, now)
            .unwrap();
        assert_eq!(summary.copied, 2);

        let source = f.server.join("Patient1").join("a.erd");
        let rel = relative(&source);
        let copy = f.local.join(&rel);
        assert_eq!(std::fs::read(&copy).unwrap(), b"12345");
        assert_eq!(
            std::fs::metadata(&copy).unwrap().modified().unwrap(),
            std::fs::metadata(&source).unwrap().modified().unwrap()
        );
        assert_eq!(f.db.logged_size(&rel).unwrap(), Some(5));

        // a second pass finds nothing new, a grown file becomes a conflict
        std::fs::write(&source, b"1234567").unwrap();
        let summary = f
            .db
            .sync_files(&f.server, &f.local, &thresholds, &f.reports, now)
            .unwrap();
        assert_eq!(summary.copied, 0);
        assert_eq!(summary.conflicts, 1);
        let report = summary.conflict_report.unwrap();
        let text = std::fs::read_to_string(&report).unwrap();
        assert!(text.starts_with("file_name,relative_path,size,"));
        assert!(text.contains(",7,"));
        assert!(text.trim_end().ends_with(",5,skip"));
        assert_eq!(std::fs::read(&copy).unwrap(), b"12345");

        // approving the conflict copies the new version
        let sheet = f.reports.join("review.csv");
        std::fs::write(&sheet, format!("relative_path,action\n{rel},update\n{rel}x,skip\n"))
            .unwrap();
        let updated = f
            .db
            .update_differences(&sheet, &f.server, &f.local, now)
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(std::fs::read(&copy).unwrap(), b"1234567");
        assert_eq!(f.db.logged_size(&rel).unwrap(), Some(7));
    }

    #[test]
    fn test_old_files_ignored() {
        let f = fixture();
        let now = OffsetDateTime::now_utc() + Duration::days(5 * 365);
        let summary = f
            .db
            .sync_files(&f.server, &f.local, &SyncThresholds::default(), &f.reports, now)
            .unwrap();
        assert_eq!(summary.ignored, 2);
        assert_eq!(f.db.events().unwrap()[0].reason, "file older than 4 years");
    }

    #[test]
    fn test_ignore_reason_follows_threshold() {
        let f = fixture();
        let thresholds = SyncThresholds {
            copy_after: Duration::hours(36),
            ignore_after: Duration::days(2 * 365),
        };
        let now = OffsetDateTime::now_utc() + Duration::days(3 * 365);
        let summary = f
            .db
            .sync_files(&f.server, &f.local, &thresholds, &f.reports, now)
            .unwrap();
        assert_eq!(summary.ignored, 2);
        assert!(f
            .db
            .events()
            .unwrap()
            .iter()
            .all(|e| e.reason == "file older than 2 years"));

        let thresholds = SyncThresholds {
            ignore_after: Duration::days(100),
            ..thresholds
        };
        assert_eq!(thresholds.ignore_reason(), "file older than 100 days");
    }

    #[test]
    fn test_snapshot_and_export() {
        let f = fixture();
        let now = OffsetDateTime::now_utc();
        assert_eq!(f.db.assume_previously_synced(&f.server, now).unwrap(), 2);
        let summary = f
            .db
            .sync_files(
                &f.server,
                &f.local,
                &SyncThresholds::default(),
                &f.reports,
                now + Duration::hours(48),
            )
            .unwrap();
        assert_eq!(summary, SyncSummary::default());

        let exported = f.db.export_table(LogTable::Sync, &f.reports, now).unwrap();
        assert!(exported
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("sync_log_"));
        let text = std::fs::read_to_string(&exported).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "relative_path,file_name,size,creation_time,modification_time,access_time"
        );
        assert_eq!(lines.count(), 2);

        let events = f.db.export_table(LogTable::Event, &f.reports, now).unwrap();
        let text = std::fs::read_to_string(events).unwrap();
        assert_eq!(text.matches("assume_synced").count(), 2);
    }
}
