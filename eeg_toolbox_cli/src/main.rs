use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::Display;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::time::Duration;

use libeeg_toolbox::archive::{
    analyze_folder, purge_folder, scan_and_verify, verify_folder, SevenZipCli,
};
use libeeg_toolbox::checksum::{hash_or_verify, process_tree, HashOutcome};
use libeeg_toolbox::clipper::{clip_edf, generate_edf_metadata, ClipRequest};
use libeeg_toolbox::compat::{check_file, scan_pipeline, CompatChecker, ExternalChecker, NativeChecker};
use libeeg_toolbox::config::{CompatConfig, Config};
use libeeg_toolbox::constants::MD5_TARGET_EXTENSIONS;
use libeeg_toolbox::converter::Converter;
use libeeg_toolbox::coverage::check_durations;
use libeeg_toolbox::metadata::{scan_folder, write_scan};
use libeeg_toolbox::reconcile::{
    cleanup_after_bids, compare_folder_with_list, find_duplicates, match_patterns, read_list,
    write_duplicate_report,
};
use libeeg_toolbox::redaction::{Approval, BackupLayout, NameList, Redactor};
use libeeg_toolbox::resident::run_resident;
use libeeg_toolbox::splitter::{split_edf, SplitOptions};
use libeeg_toolbox::sync::{LogTable, SyncDb};
use libeeg_toolbox::timecalc::{
    compute_record_indices, format_serial_datetime, now_local, serial_to_datetime,
};
use libeeg_toolbox::worker_status::{Phase, WorkerStatus};

type CliResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

fn path_arg(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help(help)
}

fn flag(name: &'static str, help: &'static str) -> Arg {
    Arg::new(name)
        .long(name)
        .action(ArgAction::SetTrue)
        .help(help)
}

fn passes_arg() -> Arg {
    Arg::new("passes")
        .long("passes")
        .value_parser(value_parser!(u64))
        .help("Stop the resident loop after this many passes")
}

fn db_arg() -> Arg {
    Arg::new("db")
        .long("db")
        .default_value("sync_log.db")
        .value_parser(value_parser!(PathBuf))
        .help("SQLite ledger")
}

fn build_cli() -> Command {
    Command::new("eeg_toolbox_cli")
        .about("Tools for the clinical EEG pipeline")
        .arg_required_else_help(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to the configuration file"),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Also write the log to this file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("split")
                .about("Split an EDF+D file at gaps into continuous EDF+C parts")
                .arg(path_arg("input", "EDF file to split"))
                .arg(path_arg("output", "Folder for the parts"))
                .arg(
                    Arg::new("gap")
                        .long("gap")
                        .default_value("10")
                        .value_parser(value_parser!(f64))
                        .help("Shortest gap, in seconds, that starts a new part"),
                )
                .arg(
                    Arg::new("chunk")
                        .long("chunk")
                        .default_value("1")
                        .value_parser(value_parser!(f64))
                        .help("Length in seconds of the blocks checked for flat signal"),
                )
                .arg(
                    Arg::new("threshold")
                        .long("threshold")
                        .default_value("1e-9")
                        .value_parser(value_parser!(f64))
                        .help("Largest absolute value still counted as flat"),
                ),
        )
        .subcommand(
            Command::new("clip")
                .about("Cut a time window and a set of signals out of an EDF file")
                .arg(path_arg("input", "EDF file to clip"))
                .arg(path_arg("output", "Clipped EDF, or the JSON description with --metadata"))
                .arg(
                    Arg::new("request")
                        .long("request")
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON clip request; the whole file is copied without one"),
                )
                .arg(flag("metadata", "Describe the input as a JSON clip request instead")),
        )
        .subcommand(
            Command::new("scan")
                .about("Tabulate EDF header fields of every file in a folder")
                .arg(path_arg("folder", "Folder to scan"))
                .arg(path_arg("output", "Output .csv, .txt or .json")),
        )
        .subcommand(
            Command::new("compat")
                .about("Check EDF files for compatibility and leave pass/fail markers")
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_parser(value_parser!(PathBuf))
                        .help("Check a single file instead of the pipeline folder"),
                )
                .arg(flag("once", "Make a single pass instead of staying resident"))
                .arg(passes_arg()),
        )
        .subcommand(
            Command::new("md5")
                .about("Write MD5 sidecars for every EDF and archive below a folder")
                .arg(path_arg("folder", "Folder to walk")),
        )
        .subcommand(
            Command::new("shalog")
                .about("Write a chunk hash log for a file, or verify the file against it")
                .arg(path_arg("file", "File to hash"))
                .arg(flag("force", "Overwrite an existing log")),
        )
        .subcommand(
            Command::new("archive")
                .about("Verify, purge and measure archived recordings")
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("verify")
                        .about("Compare EDF files with their copies in rar archives")
                        .arg(path_arg("folder", "Folder to verify")),
                )
                .subcommand(
                    Command::new("purge")
                        .about("Delete EDF files confirmed equal to their archived copy")
                        .arg(path_arg("folder", "Folder to purge"))
                        .arg(flag("dry-run", "Only list what would be deleted")),
                )
                .subcommand(
                    Command::new("size")
                        .about("Report compressed and uncompressed sizes")
                        .arg(path_arg("folder", "Folder to measure")),
                )
                .subcommand(
                    Command::new("scan")
                        .about("Find and verify folders holding both EDF and rar files")
                        .arg(flag("once", "Make a single pass instead of staying resident"))
                        .arg(passes_arg()),
                ),
        )
        .subcommand(
            Command::new("redact")
                .about("Remove names from BIDS .tsv and .json files")
                .arg(path_arg("input", "BIDS folder"))
                .arg(path_arg("names", "CSV with lastname and firstname columns"))
                .arg(path_arg("backup-org", "Where originals are kept"))
                .arg(path_arg("backup-upd", "Where redacted copies are kept"))
                .arg(flag("yes", "Approve every replacement without asking")),
        )
        .subcommand(
            Command::new("compare-list")
                .about("Compare the subfolders of a folder with a list of names")
                .arg(path_arg("folder", "Folder to compare"))
                .arg(path_arg("list", "Text file with one name per line")),
        )
        .subcommand(
            Command::new("name-check")
                .about("Check that every (wildcard) name in a list exists in a folder")
                .arg(path_arg("list", "Text file with one pattern per line"))
                .arg(path_arg("base", "Folder to look in")),
        )
        .subcommand(
            Command::new("bids-cleanup")
                .about("Delete or move raw files already converted to BIDS")
                .arg(path_arg("sheet", "CSV match sheet"))
                .arg(path_arg("source", "Raw folder the sheet paths are relative to"))
                .arg(path_arg("dest", "Folder leftover files move to"))
                .arg(flag("dry-run", "Only list the actions")),
        )
        .subcommand(
            Command::new("duplicates")
                .about("Find raw EDF files that already exist in the BIDS tree")
                .arg(path_arg("bids", "BIDS root"))
                .arg(path_arg("raw", "Raw root"))
                .arg(path_arg("report", "CSV report to write")),
        )
        .subcommand(
            Command::new("coverage")
                .about("Check that a scans.tsv covers every day of the stay")
                .arg(path_arg("tsv", "scans.tsv to check"))
                .arg(path_arg("log", "Log file findings are appended to")),
        )
        .subcommand(
            Command::new("sync")
                .about("Mirror settled server files to a local folder")
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("run")
                        .about("Copy new files and report conflicts")
                        .arg(path_arg("server", "Server folder"))
                        .arg(path_arg("local", "Local mirror"))
                        .arg(db_arg()),
                )
                .subcommand(
                    Command::new("assume")
                        .about("Record every server file as already synced")
                        .arg(path_arg("server", "Server folder"))
                        .arg(db_arg()),
                )
                .subcommand(
                    Command::new("update")
                        .about("Copy the conflict rows marked 'update'")
                        .arg(path_arg("sheet", "Reviewed conflict sheet"))
                        .arg(path_arg("server", "Server folder"))
                        .arg(path_arg("local", "Local mirror"))
                        .arg(db_arg()),
                )
                .subcommand(
                    Command::new("export")
                        .about("Dump a ledger table to CSV")
                        .arg(
                            Arg::new("table")
                                .required(true)
                                .value_parser(["sync", "event"])
                                .help("Table to export"),
                        )
                        .arg(db_arg()),
                ),
        )
        .subcommand(
            Command::new("record-index")
                .about("Data record range covering a wall-clock window")
                .arg(
                    Arg::new("records")
                        .long("records")
                        .required(true)
                        .value_parser(value_parser!(u64))
                        .help("Number of data records"),
                )
                .arg(
                    Arg::new("duration")
                        .long("duration")
                        .required(true)
                        .help("Recording duration as HH:MM:SS"),
                )
                .arg(
                    Arg::new("start")
                        .long("start")
                        .required(true)
                        .help("Recording start as HH:MM:SS"),
                )
                .arg(Arg::new("from").long("from").required(true).help("Window start"))
                .arg(Arg::new("to").long("to").required(true).help("Window end"))
                .arg(
                    Arg::new("pre")
                        .long("pre")
                        .default_value("0")
                        .value_parser(value_parser!(i64))
                        .help("Minutes added before the window"),
                )
                .arg(
                    Arg::new("post")
                        .long("post")
                        .default_value("0")
                        .value_parser(value_parser!(i64))
                        .help("Minutes added after the window"),
                ),
        )
        .subcommand(
            Command::new("serial-date")
                .about("Convert a spreadsheet serial date")
                .arg(
                    Arg::new("value")
                        .required(true)
                        .allow_negative_numbers(true)
                        .value_parser(value_parser!(f64)),
                ),
        )
        .subcommand(
            Command::new("convert")
                .about("Run the resident EDF export controller")
                .arg(flag("once", "Make a single pass instead of staying resident"))
                .arg(passes_arg()),
        )
}

fn init_logging(pb_manager: &MultiProgress, log_file: Option<&PathBuf>) -> CliResult<()> {
    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> = vec![simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )];
    if let Some(path) = log_file {
        loggers.push(simplelog::WriteLogger::new(
            simplelog::LevelFilter::Info,
            simplelog::Config::default(),
            File::create(path)?,
        ));
    }
    LogWrapper::new(pb_manager.clone(), simplelog::CombinedLogger::new(loggers)).try_init()?;
    Ok(())
}

fn bar_style(phase: Phase) -> ProgressStyle {
    let color = match phase {
        Phase::Read => "cyan/blue",
        Phase::Write => "green/white",
        Phase::Hash => "yellow/white",
        Phase::Verify => "magenta/white",
    };
    ProgressStyle::with_template(&format!(
        "{{prefix}} [{{bar:40.{color}}}] {{percent:>3}}% {{wide_msg}}"
    ))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

type Bars = HashMap<usize, (ProgressBar, Phase)>;

/// Draw one status message, adding a bar for a worker on its first message
fn show_status(pb_manager: &MultiProgress, bars: &mut Bars, status: WorkerStatus) {
    let (bar, phase) = bars.entry(status.worker_id).or_insert_with(|| {
        let bar = pb_manager.add(ProgressBar::new(100));
        bar.set_style(bar_style(status.phase));
        bar.set_prefix(format!("Worker {}", status.worker_id));
        (bar, status.phase)
    });
    if *phase != status.phase {
        bar.set_style(bar_style(status.phase));
        *phase = status.phase;
    }
    bar.set_position((status.progress * 100.0) as u64);
    bar.set_message(status.item);
}

/// Spawn `task` and draw its status messages until it ends. Messages still queued when the
/// task finishes are drawn before the bars are finished.
fn follow_task<T, E, F>(
    pb_manager: &MultiProgress,
    task: F,
) -> (Bars, std::thread::Result<Result<T, E>>)
where
    T: Send + 'static,
    E: Error + Send + Sync + 'static,
    F: FnOnce(Sender<WorkerStatus>) -> Result<T, E> + Send + 'static,
{
    let (tx, rx) = channel::<WorkerStatus>();
    let handle = std::thread::spawn(move || task(tx));
    let mut bars = Bars::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(status) => show_status(pb_manager, &mut bars, status),
            Err(_) => {
                if handle.is_finished() {
                    break;
                }
            }
        }
    }
    for status in rx.try_iter() {
        show_status(pb_manager, &mut bars, status);
    }

    for (bar, _) in bars.values() {
        bar.finish();
    }
    (bars, handle.join())
}

/// Run `task` on its own thread, drawing its status messages as progress bars
fn run_task<T, E, F>(pb_manager: &MultiProgress, task: F) -> CliResult<T>
where
    T: Send + 'static,
    E: Error + Send + Sync + 'static,
    F: FnOnce(Sender<WorkerStatus>) -> Result<T, E> + Send + 'static,
{
    match follow_task(pb_manager, task).1 {
        Ok(result) => Ok(result?),
        Err(_) => Err("Failed to join worker task!".into()),
    }
}

/// Run `task` every `interval`, or just once. `passes` ends the loop early.
fn resident<E, F>(interval: Duration, once: bool, passes: Option<u64>, mut task: F)
where
    E: Display,
    F: FnMut() -> Result<(), E>,
{
    let limit = if once { Some(1) } else { passes };
    let stop = AtomicBool::new(false);
    let mut made = 0;
    let total = run_resident(interval, &stop, || {
        let result = task();
        made += 1;
        if limit.is_some_and(|l| made >= l) {
            stop.store(true, Ordering::Relaxed);
        }
        result
    });
    log::info!("Resident loop ended after {total} passes.");
}

fn load_config(config_path: Option<&PathBuf>) -> CliResult<Config> {
    let config_path = config_path.ok_or("A configuration file is required (-p/--path)")?;
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = Config::read_config_file(config_path)?;
    log::info!("Config successfully loaded.");
    Ok(config)
}

fn path<'a>(matches: &'a ArgMatches, name: &str) -> CliResult<&'a PathBuf> {
    matches
        .get_one::<PathBuf>(name)
        .ok_or_else(|| format!("Missing argument {name}").into())
}

fn text<'a>(matches: &'a ArgMatches, name: &str) -> CliResult<&'a String> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| format!("Missing argument {name}").into())
}

fn make_checker(config: &CompatConfig) -> CliResult<Box<dyn CompatChecker>> {
    let checker: Box<dyn CompatChecker> = match &config.checker_path {
        Some(program) => {
            log::info!("Using external checker {}", program.display());
            Box::new(ExternalChecker::new(program)?)
        }
        None => {
            log::info!("Using built-in EDF validator");
            Box::new(NativeChecker)
        }
    };
    Ok(checker)
}

fn run_compat(matches: &ArgMatches, config_path: Option<&PathBuf>) -> CliResult<()> {
    if let Some(file) = matches.get_one::<PathBuf>("file") {
        let checker: Box<dyn CompatChecker> = match config_path {
            Some(_) => make_checker(&load_config(config_path)?.compat)?,
            None => Box::new(NativeChecker),
        };
        match check_file(checker.as_ref(), file)? {
            Some(true) => log::info!("{} is compatible.", file.display()),
            Some(false) => log::warn!("{} is not compatible.", file.display()),
            None => log::info!("{} was checked before.", file.display()),
        }
        return Ok(());
    }

    let config = load_config(config_path)?;
    let checker = make_checker(&config.compat)?;
    let folder = &config.compat.pipeline_folder;
    if !folder.is_dir() {
        return Err(format!("Pipeline folder {} does not exist", folder.display()).into());
    }
    log::info!("Monitoring folder: {}", folder.display());
    resident(
        Duration::from_secs(config.compat.interval_secs),
        matches.get_flag("once"),
        matches.get_one::<u64>("passes").copied(),
        || {
            scan_pipeline(folder, checker.as_ref()).map(|summary| {
                log::info!(
                    "Pass complete: {} passed, {} failed, {} in use.",
                    summary.passed,
                    summary.failed,
                    summary.locked
                )
            })
        },
    );
    Ok(())
}

fn run_archive(matches: &ArgMatches, config_path: Option<&PathBuf>) -> CliResult<()> {
    let config = match config_path {
        Some(_) => load_config(config_path)?,
        None => Config::default(),
    };
    let archiver = SevenZipCli::new(&config.archive.archiver_path);
    match matches.subcommand() {
        Some(("verify", sub)) => {
            let summary = verify_folder(path(sub, "folder")?, &archiver, &config.archive.temp_dir)?;
            log::info!(
                "Verified archives: {} equal, {} different, {} skipped.",
                summary.equal,
                summary.diff,
                summary.skipped
            );
        }
        Some(("purge", sub)) => {
            let dry_run = sub.get_flag("dry-run");
            let deleted = purge_folder(path(sub, "folder")?, dry_run)?;
            let verb = if dry_run { "Would delete" } else { "Deleted" };
            log::info!("{verb} {} files.", deleted.len());
        }
        Some(("size", sub)) => {
            let totals = analyze_folder(path(sub, "folder")?, &archiver)?;
            println!("{totals}");
        }
        Some(("scan", sub)) => {
            let archive = &config.archive;
            resident(
                Duration::from_secs(archive.interval_secs),
                sub.get_flag("once"),
                sub.get_one::<u64>("passes").copied(),
                || {
                    scan_and_verify(
                        &archive.search_dirs,
                        &archiver,
                        &archive.temp_dir,
                        &archive.list_path,
                    )
                    .map(|_| ())
                },
            );
        }
        _ => return Err("Unknown archive command".into()),
    }
    Ok(())
}

fn run_sync(matches: &ArgMatches, config_path: Option<&PathBuf>) -> CliResult<()> {
    let config = match config_path {
        Some(_) => load_config(config_path)?.sync,
        None => Config::default().sync,
    };
    let Some((name, sub)) = matches.subcommand() else {
        return Err("Unknown sync command".into());
    };
    let db = SyncDb::open(path(sub, "db")?)?;
    let now = now_local();
    match name {
        "run" => {
            let summary = db.sync_files(
                path(sub, "server")?,
                path(sub, "local")?,
                &config.thresholds(),
                &config.report_dir,
                now,
            )?;
            log::info!(
                "Sync complete: {} copied, {} skipped, {} ignored, {} conflicts.",
                summary.copied,
                summary.skipped,
                summary.ignored,
                summary.conflicts
            );
            if let Some(report) = summary.conflict_report {
                log::warn!("Review conflicts in {}", report.display());
            }
        }
        "assume" => {
            let count = db.assume_previously_synced(path(sub, "server")?, now)?;
            log::info!("Recorded {count} files as already synced.");
        }
        "update" => {
            let count = db.update_differences(
                path(sub, "sheet")?,
                path(sub, "server")?,
                path(sub, "local")?,
                now,
            )?;
            log::info!("Updated {count} files.");
        }
        "export" => {
            let table = match sub.get_one::<String>("table").map(|s| s.as_str()) {
                Some("event") => LogTable::Event,
                _ => LogTable::Sync,
            };
            let out = db.export_table(table, &config.report_dir, now)?;
            log::info!("Exported {} to {}", table.name(), out.display());
        }
        _ => return Err("Unknown sync command".into()),
    }
    Ok(())
}

fn run_converter(matches: &ArgMatches, config_path: Option<&PathBuf>) -> CliResult<()> {
    let config = load_config(config_path)?.converter;
    config.validate()?;
    log::info!("Input Path: {}", config.input_folder.to_string_lossy());
    log::info!("Output Path: {}", config.output_folder.to_string_lossy());
    log::info!("Archive Path: {}", config.archive_folder.to_string_lossy());
    log::info!("Exporter: {}", config.exporter_path.to_string_lossy());
    let interval = config.interval();
    let converter = Converter::new(config);
    resident(
        interval,
        matches.get_flag("once"),
        matches.get_one::<u64>("passes").copied(),
        || {
            converter.run_pass().map(|outcomes| {
                for (folder, outcome) in outcomes {
                    log::info!("{folder}: {outcome:?}");
                }
            })
        },
    );
    Ok(())
}

fn dispatch(matches: &ArgMatches, pb_manager: &MultiProgress) -> CliResult<()> {
    let config_path = matches.get_one::<PathBuf>("path");
    match matches.subcommand() {
        Some(("new", _)) => {
            let config_path = config_path.ok_or("A path is required (-p/--path)")?;
            log::info!(
                "Making a template config at {}...",
                config_path.to_string_lossy()
            );
            Config::default().write_config_file(config_path)?;
        }
        Some(("split", sub)) => {
            let input = path(sub, "input")?.clone();
            let output = path(sub, "output")?.clone();
            let options = SplitOptions {
                gap_sec: sub.get_one::<f64>("gap").copied().unwrap_or(10.0),
                chunk_sec: sub.get_one::<f64>("chunk").copied().unwrap_or(1.0),
                threshold: sub.get_one::<f64>("threshold").copied().unwrap_or(1e-9),
            };
            let segments = run_task(pb_manager, move |tx| {
                split_edf(&input, &output, &options, &tx, &0)
            })?;
            for segment in segments {
                log::info!(
                    "Part {}: {} ({:.3} s to {:.3} s)",
                    segment.index,
                    segment.path.display(),
                    segment.start_sec,
                    segment.end_sec
                );
            }
        }
        Some(("clip", sub)) => {
            let input = path(sub, "input")?.clone();
            let output = path(sub, "output")?.clone();
            if sub.get_flag("metadata") {
                generate_edf_metadata(&input, &output)?;
                log::info!("Wrote {}", output.display());
            } else {
                let request = match sub.get_one::<PathBuf>("request") {
                    Some(request) => ClipRequest::read_file(request)?,
                    None => ClipRequest::default(),
                };
                let records = run_task(pb_manager, move |tx| {
                    clip_edf(&input, &output, &request, &tx, &0)
                })?;
                log::info!("Wrote {records} records.");
            }
        }
        Some(("scan", sub)) => {
            let rows = scan_folder(path(sub, "folder")?)?;
            write_scan(&rows, path(sub, "output")?)?;
            log::info!("Described {} EDF files.", rows.len());
        }
        Some(("compat", sub)) => run_compat(sub, config_path)?,
        Some(("md5", sub)) => {
            let folder = path(sub, "folder")?.clone();
            run_task(pb_manager, move |tx| {
                process_tree(&folder, &MD5_TARGET_EXTENSIONS, &tx, &0)
            })?;
        }
        Some(("shalog", sub)) => match hash_or_verify(path(sub, "file")?, sub.get_flag("force"))? {
            HashOutcome::Written(log_path) => log::info!("Wrote {}", log_path.display()),
            HashOutcome::Verified(report) => {
                if report.is_clean() {
                    log::info!("File matches its chunk log.");
                } else {
                    log::warn!("File differs from its chunk log.");
                }
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        },
        Some(("archive", sub)) => run_archive(sub, config_path)?,
        Some(("redact", sub)) => {
            let names = NameList::load_csv(path(sub, "names")?)?;
            let approval = if sub.get_flag("yes") {
                Approval::AutoApprove
            } else {
                Approval::TerminalPrompt
            };
            let layout = BackupLayout {
                input_folder: path(sub, "input")?.clone(),
                backup_org: path(sub, "backup-org")?.clone(),
                backup_upd: path(sub, "backup-upd")?.clone(),
            };
            let changed = Redactor::new(&names, approval)?.redact_tree(&layout)?;
            log::info!("Redacted {changed} files.");
        }
        Some(("compare-list", sub)) => {
            let comparison = compare_folder_with_list(path(sub, "folder")?, path(sub, "list")?)?;
            log::info!(
                "{} names listed, {} folders found.",
                comparison.expected,
                comparison.found
            );
            for name in comparison.missing_on_disk.iter() {
                println!("Missing on disk: {name}");
            }
            for name in comparison.extras_on_disk.iter() {
                println!("Not in list: {name}");
            }
        }
        Some(("name-check", sub)) => {
            let patterns = read_list(path(sub, "list")?)?;
            let matches = match_patterns(&patterns, path(sub, "base")?)?;
            for name in matches.found.iter() {
                println!("Found: {name}");
            }
            for name in matches.not_found.iter() {
                println!("Not found: {name}");
            }
            log::info!(
                "{} found, {} not found.",
                matches.found.len(),
                matches.not_found.len()
            );
        }
        Some(("bids-cleanup", sub)) => {
            let actions = cleanup_after_bids(
                path(sub, "sheet")?,
                path(sub, "source")?,
                path(sub, "dest")?,
                sub.get_flag("dry-run"),
            )?;
            log::info!("{} cleanup actions.", actions.len());
        }
        Some(("duplicates", sub)) => {
            let report = find_duplicates(path(sub, "bids")?, path(sub, "raw")?)?;
            write_duplicate_report(&report, path(sub, "report")?)?;
            log::info!(
                "{} duplicate keys, {} compliant raw copies, {} without pass marker.",
                report.duplicate_keys,
                report.compliant.len(),
                report.missing_pass.len()
            );
        }
        Some(("coverage", sub)) => {
            let report = check_durations(path(sub, "tsv")?, path(sub, "log")?)?;
            log::info!("{} missing days.", report.missing_days().len());
        }
        Some(("sync", sub)) => run_sync(sub, config_path)?,
        Some(("record-index", sub)) => {
            let window = compute_record_indices(
                sub.get_one::<u64>("records").copied().unwrap_or_default(),
                text(sub, "duration")?,
                text(sub, "start")?,
                text(sub, "from")?,
                text(sub, "to")?,
                sub.get_one::<i64>("pre").copied().unwrap_or_default(),
                sub.get_one::<i64>("post").copied().unwrap_or_default(),
            )?;
            println!("{window}");
        }
        Some(("serial-date", sub)) => {
            let value = sub.get_one::<f64>("value").copied().unwrap_or_default();
            println!("{}", format_serial_datetime(&serial_to_datetime(value)?)?);
        }
        Some(("convert", sub)) => run_converter(sub, config_path)?,
        _ => (),
    }
    Ok(())
}

fn main() {
    // Create a cli
    let matches = build_cli().get_matches();

    // Initialize feedback
    let pb_manager = MultiProgress::new();
    if let Err(e) = init_logging(&pb_manager, matches.get_one::<PathBuf>("log-file")) {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }

    match dispatch(&matches, &pb_manager) {
        Ok(()) => log::info!("Done."),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indicatif::ProgressDrawTarget;

    #[test]
    fn test_cli_definition() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let matches = build_cli()
            .try_get_matches_from(["eeg_toolbox_cli", "archive", "purge", "/data", "--dry-run"])
            .unwrap();
        let (_, archive) = matches.subcommand().unwrap();
        let (name, purge) = archive.subcommand().unwrap();
        assert_eq!(name, "purge");
        assert!(purge.get_flag("dry-run"));
        assert_eq!(path(purge, "folder").unwrap(), &PathBuf::from("/data"));

        let matches = build_cli()
            .try_get_matches_from(["eeg_toolbox_cli", "serial-date", "--", "-1.5"])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<f64>("value"), Some(&-1.5));
    }

    #[test]
    fn test_follow_task_draws_final_status() {
        let pb_manager = MultiProgress::with_draw_target(ProgressDrawTarget::hidden());
        let (bars, joined) = follow_task(&pb_manager, |tx| {
            tx.send(WorkerStatus::new(0.5, "night.edf", 3, Phase::Read))?;
            tx.send(WorkerStatus::new(1.0, "night.edf", 3, Phase::Write))?;
            Ok::<_, std::sync::mpsc::SendError<WorkerStatus>>(7)
        });

        assert_eq!(joined.unwrap().unwrap(), 7);
        let (bar, phase) = &bars[&3];
        assert_eq!(bar.position(), 100);
        assert_eq!(*phase, Phase::Write);
        assert!(bar.is_finished());
    }

    #[test]
    fn test_resident_once() {
        let mut calls = 0;
        resident(Duration::from_millis(1), true, None, || {
            calls += 1;
            Ok::<(), String>(())
        });
        assert_eq!(calls, 1);
        let mut calls = 0;
        resident(Duration::from_millis(1), false, Some(3), || {
            calls += 1;
            Err::<(), String>(String::from("keeps going"))
        });
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_new_template() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let matches = build_cli()
            .try_get_matches_from([
                "eeg_toolbox_cli",
                "-p",
                config_path.to_str().unwrap(),
                "new",
            ])
            .unwrap();
        dispatch(&matches, &MultiProgress::new()).unwrap();
        assert_eq!(Config::read_config_file(&config_path).unwrap(), Config::default());
    }
}
