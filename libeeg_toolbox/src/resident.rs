use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Longest single sleep while waiting for the next pass, so a stop request is seen quickly
const STOP_POLL: Duration = Duration::from_millis(200);

/// Run `task` every `interval` until `stop` is set. Errors are logged and the loop
/// keeps going. Returns the number of passes made.
pub fn run_resident<E, F>(interval: Duration, stop: &AtomicBool, mut task: F) -> u64
where
    E: Display,
    F: FnMut() -> Result<(), E>,
{
    let mut passes = 0;
    while !stop.load(Ordering::Relaxed) {
        if let Err(e) = task() {
            log::error!("{e}");
        }
        passes += 1;

        let wake = Instant::now() + interval;
        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            std::thread::sleep(STOP_POLL.min(wake - now));
        }
    }
    passes
}

fn lock_probe_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.__lockcheck__.{}", ext.to_string_lossy()),
        None => format!("{stem}.__lockcheck__"),
    };
    path.with_file_name(name)
}

/// Whether another process holds `path` open, probed by renaming it out and back.
pub fn is_file_locked(path: &Path) -> bool {
    let probe = lock_probe_path(path);
    if std::fs::rename(path, &probe).is_err() {
        return true;
    }
    if std::fs::rename(&probe, path).is_err() {
        if probe.exists() && !path.exists() {
            if let Err(e) = std::fs::rename(&probe, path) {
                log::error!(
                    "Could not restore {} from {}: {e}",
                    path.display(),
                    probe.display()
                );
            }
        }
        return true;
    }
    false
}

/// Move a file or folder, falling back to copy-and-delete when a rename is not possible
/// (e.g. across volumes). Missing parents of `to` are created.
pub fn move_path(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    if from.is_dir() {
        for entry in walkdir::WalkDir::new(from) {
            let entry = entry.map_err(std::io::Error::other)?;
            let Ok(relative) = entry.path().strip_prefix(from) else {
                continue;
            };
            let target = to.join(relative);
            if entry.file_type().is_dir() {
                std::fs::create_dir_all(&target)?;
            } else {
                std::fs::copy(entry.path(), &target)?;
            }
        }
        std::fs::remove_dir_all(from)
    } else {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)
    }
}
