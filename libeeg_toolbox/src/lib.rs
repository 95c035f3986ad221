//! # eeg_toolbox
//!
//! eeg_toolbox is a set of tools for running a clinical EEG data pipeline, written in
//! Rust. Recordings arrive as EDF/EDF+ files (or as vendor session folders converted to
//! EDF by an external exporter), get checked and split, are archived next to compressed
//! copies, and end up in a BIDS tree whose sidecars must not carry patient names.
//!
//! ## Building & Install
//!
//! To build and install the CLI use `cargo install --path ./eeg_toolbox_cli` from the top
//! level repository. The library itself is `libeeg_toolbox`.
//!
//! ## Tools
//!
//! - EDF codec: [`edf_header`], [`edf_reader`], [`edf_writer`] and [`annotation`] read and
//! write EDF and EDF+ (continuous and discontinuous) files, including TAL annotations.
//! - [`splitter`]: split an EDF+D recording at gaps into continuous EDF+C parts.
//! - [`clipper`]: cut a time window and a subset of signals out of a recording, driven by
//! a JSON request. The request format is also produced by `generate_edf_metadata`.
//! - [`metadata`]: scan a folder and tabulate header fields of every EDF as CSV, TSV or JSON.
//! - [`compat`]: check EDF files for standard compliance and leave `.edf_pass`/`.edf_fail`
//! markers, once or as a resident loop over a pipeline folder.
//! - [`checksum`]: MD5 sidecars for a tree, and per-chunk SHA-256 logs (`.shalog`) used to
//! find where a file changed.
//! - [`archive`]: confirm that an EDF inside a rar archive is identical to the loose copy,
//! purge verified copies, and account for compressed and uncompressed sizes.
//! - [`redaction`]: remove names from BIDS `.tsv` and `.json` sidecars, keeping backups of
//! the original and redacted files.
//! - [`reconcile`]: compare folders against lists, clean up raw files already converted to
//! BIDS, and find raw EDFs duplicated in the BIDS tree.
//! - [`coverage`]: check that a subject's `scans.tsv` covers every day of the stay.
//! - [`sync`]: copy settled files from a server share to a local mirror, logging every file
//! in a SQLite ledger.
//! - [`timecalc`]: record index ranges for a wall-clock window, and spreadsheet serial dates.
//! - [`converter`]: resident controller around an external EDF exporter.
//!
//! ## Configuration
//!
//! The resident tools read a YAML configuration file. A template can be made with
//! `eeg_toolbox_cli new -p config.yaml`. The format is as follows:
//!
//! ```yml
//! compat:
//!   pipeline_folder: None
//!   checker_path: null
//!   interval_secs: 60
//! archive:
//!   search_dirs: []
//!   archiver_path: 7z
//!   temp_dir: ./tmp_dir
//!   list_path: matching_folders.txt
//!   interval_secs: 60
//! converter:
//!   input_folder: None
//!   output_folder: None
//!   archive_folder: None
//!   exporter_path: None
//!   template_path: None
//!   processed_list: processed_list.txt
//!   interval_secs: 10
//!   stall_mb_per_min: 10.0
//!   monitor_interval_secs: 15.0
//!   stall_window_secs: 60.0
//! sync:
//!   copy_after_hours: 36
//!   ignore_after_years: 4
//!   report_dir: .
//! ```
//!
//! Missing sections or fields take the defaults above. If `compat.checker_path` is `null`
//! the built-in EDF validator is used.
//!
//! ## Output
//!
//! Every tool logs through the `log` facade. The CLI writes to the terminal and, when asked,
//! to a log file as well. Long running tools report progress as [`worker_status::WorkerStatus`]
//! messages over a channel.
pub mod annotation;
pub mod archive;
pub mod checksum;
pub mod clipper;
pub mod compat;
pub mod config;
pub mod constants;
pub mod converter;
pub mod coverage;
pub mod edf_header;
pub mod edf_reader;
pub mod edf_writer;
pub mod error;
pub mod metadata;
pub mod reconcile;
pub mod redaction;
pub mod resident;
pub mod splitter;
pub mod sync;
pub mod timecalc;
pub mod worker_status;
