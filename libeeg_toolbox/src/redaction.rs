//! Patient-name redaction for BIDS `.tsv` and `.json` sidecars.
//!
//! Names come from a demographics CSV. A fast pass over each text value finds candidate
//! names (case-insensitive, longest first, non-overlapping); each candidate is then matched
//! with a stricter per-name pattern that tolerates separators, middle initials and the
//! `Last, F.` form. Accepted matches are replaced by `.X.` (or `.x.` for lowercase text).
//!
//! A changed file keeps three copies: the original under `backup_org/<rel>`, the redacted
//! version under `backup_upd/<rel>` and the redacted version in place.
use fxhash::{FxHashMap, FxHashSet};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use serde_json::Value;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::error::RedactionError;
use super::resident::move_path;
use super::timecalc::file_timestamp;

/// Separators tried between name parts when building variants
const NAME_SEPARATORS: [&str; 12] = [
    "", "_", ",", ".", "|", ";", "-", "  ", ", ", ": ", " :", ":",
];

const SEP_CLASS: &str = r"[ \t_\.,\|;\-]+";

/// Words that contain names by accident (clinical vocabulary, montage labels). They are
/// blanked out before a candidate is confirmed.
const IGNORE_WORDS: [&str; 50] = [
    "obscur", "please", "clean", "leans", "polyspik", "adjustin", "against", "covering",
    "fluttering", "leaving", "technician", "LIAN+", "max 2", "max 3", "max 4", "max 5",
    "max 6", "max 7", "max 8", "max 9", "max 0", "max L", "Max L", "clear", "polys",
    "piano", "todd's", "todds", "quivering", "ering", "POLYSPIK", "against", "leaves",
    "Todds", "Todd's", "sparkling", "Clear", "unpleasant", "leading", "PLEASE", "variant",
    " IAn", "maximum", "Maximum", "MAXIMUM", " max ", "LIAn", "automatic", "automatically",
    "auto",
];

/// Name forms loaded from the demographics list
#[derive(Debug, Clone, Default)]
pub struct NameList {
    pub last_names: FxHashSet<String>,
    pub first_names: FxHashSet<String>,
    pub full_variants: FxHashSet<String>,
    pub reverse_variants: FxHashSet<String>,
}

impl NameList {
    /// Read `lastname`/`firstname` columns; rows missing either are ignored
    pub fn load_csv(path: &Path) -> Result<Self, RedactionError> {
        if !path.exists() {
            return Err(RedactionError::BadNameList(path.to_path_buf()));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let column = |name: &'static str| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .ok_or(RedactionError::MissingColumn(name))
        };
        let last_idx = column("lastname")?;
        let first_idx = column("firstname")?;

        let mut names = Self::default();
        for record in reader.records() {
            let record = record?;
            let last = record.get(last_idx).unwrap_or_default().trim();
            let first = record.get(first_idx).unwrap_or_default().trim();
            names.add(first, last);
        }
        Ok(names)
    }

    pub fn add(&mut self, first: &str, last: &str) {
        if first.is_empty() || last.is_empty() {
            return;
        }
        self.last_names.insert(last.to_string());
        self.first_names.insert(first.to_string());
        let initial: String = first.chars().take(1).collect();

        self.full_variants.insert(format!("{first} {last}"));
        for variant in [
            format!("{last} {first}"),
            format!("{last}, {first}"),
            format!("{last}, {initial}"),
            format!("{last}, {initial}."),
        ] {
            self.reverse_variants.insert(variant);
        }
        for sep in NAME_SEPARATORS {
            self.full_variants.insert(format!("{first}{sep}{last}"));
            self.reverse_variants.insert(format!("{last}{sep}{first}"));
            self.reverse_variants.insert(format!("{last}{sep}{initial}"));
            self.reverse_variants.insert(format!("{last}{sep}{initial}."));
        }
    }

    pub fn all_names(&self) -> FxHashSet<String> {
        self.last_names
            .iter()
            .chain(self.first_names.iter())
            .chain(self.full_variants.iter())
            .chain(self.reverse_variants.iter())
            .cloned()
            .collect()
    }
}

fn starts_clean(text: &str, start: usize) -> bool {
    text[..start]
        .chars()
        .next_back()
        .map_or(true, |c| c.is_whitespace() || ":([{".contains(c))
}

fn ends_clean(text: &str, end: usize) -> bool {
    text[end..]
        .chars()
        .next()
        .map_or(true, |c| c.is_whitespace() || ".,;|-])}".contains(c))
}

/// Pattern for one candidate name, only accepted where the match starts at a token start
/// and ends at a token end
#[derive(Debug, Clone)]
pub struct NamePattern {
    regex: Regex,
}

impl NamePattern {
    /// Byte ranges of boundary-respecting, non-overlapping matches
    pub fn find_all(&self, text: &str) -> Vec<(usize, usize)> {
        let mut found = Vec::new();
        let mut pos = 0;
        while pos <= text.len() {
            let Some(m) = self.regex.find_at(text, pos) else {
                break;
            };
            if m.start() < m.end() && starts_clean(text, m.start()) && ends_clean(text, m.end()) {
                found.push((m.start(), m.end()));
                pos = m.end();
            } else {
                // retry from the next character after the rejected start
                pos = m.start()
                    + text[m.start()..]
                        .chars()
                        .next()
                        .map_or(1, |c| c.len_utf8());
            }
        }
        found
    }

    pub fn is_match(&self, text: &str) -> bool {
        !self.find_all(text).is_empty()
    }

    /// Replace every match with `.X.`, or `.x.` when the matched text starts lowercase
    pub fn replace_all(&self, text: &str) -> (String, bool) {
        let matches = self.find_all(text);
        if matches.is_empty() {
            return (text.to_string(), false);
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (start, end) in matches {
            out.push_str(&text[last..start]);
            let upper = text[start..end]
                .chars()
                .next()
                .is_some_and(|c| c.is_uppercase());
            out.push_str(if upper { ".X." } else { ".x." });
            last = end;
        }
        out.push_str(&text[last..]);
        (out, true)
    }
}

/// Build the matching pattern for a raw candidate name:
/// `Last, F` and `Last, First` match the last name with any first name sharing the initial,
/// `First Last` allows an optional middle initial and any separator run,
/// anything else matches literally with flexible separators.
pub fn compiled_name_pattern(raw_name: &str) -> Result<NamePattern, RedactionError> {
    let comma_form = Regex::new(r"^\s*([A-Za-z'`\-]+)\s*,\s*([A-Za-z])[A-Za-z]*\.?\s*$")?;
    let space_form = Regex::new(r"^\s*([A-Za-z]+)\s+([A-Za-z'`\-]+)\s*$")?;
    let name = raw_name.trim();

    let body = if let Some(caps) = comma_form.captures(name) {
        format!(
            r"{}\s*,\s*{}[A-Za-z]*\.?",
            regex::escape(&caps[1]),
            regex::escape(&caps[2])
        )
    } else if let Some(caps) = space_form.captures(name) {
        format!(
            r"{first}(?:{SEP_CLASS}[A-Za-z]\.?)?{SEP_CLASS}{last}",
            first = regex::escape(&caps[1]),
            last = regex::escape(&caps[2]),
        )
    } else {
        let separators = Regex::new(SEP_CLASS)?;
        separators
            .split(name)
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(SEP_CLASS)
    };
    let regex = RegexBuilder::new(&body).case_insensitive(true).build()?;
    Ok(NamePattern { regex })
}

/// How a confirmed candidate gets approved for replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    AutoApprove,
    /// Ask on the terminal; a blank answer or `y` accepts
    TerminalPrompt,
}

impl Approval {
    fn approve(
        &self,
        text: &str,
        stripped: &str,
        raw_name: &str,
        file: &Path,
    ) -> Result<bool, RedactionError> {
        match self {
            Self::AutoApprove => Ok(true),
            Self::TerminalPrompt => {
                let mut stdout = std::io::stdout();
                writeln!(stdout, "{}", "=".repeat(80))?;
                writeln!(
                    stdout,
                    "Found match upd: {}, in file = <{}>",
                    stripped.trim(),
                    file.display()
                )?;
                writeln!(stdout, "Found match: {}", text.trim())?;
                write!(
                    stdout,
                    "Replace '{raw_name}' (incl. full first name if present) with '.X.'? (y or enter/n): "
                )?;
                stdout.flush()?;
                let mut answer = String::new();
                std::io::stdin().read_line(&mut answer)?;
                let answer = answer.trim().to_lowercase();
                Ok(answer.is_empty() || answer == "y")
            }
        }
    }
}

/// Input folder and the two backup trees
#[derive(Debug, Clone)]
pub struct BackupLayout {
    pub input_folder: PathBuf,
    pub backup_org: PathBuf,
    pub backup_upd: PathBuf,
}

impl BackupLayout {
    fn relative<'a>(&self, path: &'a Path) -> Result<&'a Path, RedactionError> {
        path.strip_prefix(&self.input_folder)
            .map_err(|_| RedactionError::OutsideInput(path.to_path_buf(), self.input_folder.clone()))
    }

    fn is_backup(&self, path: &Path) -> bool {
        path.starts_with(&self.backup_org) || path.starts_with(&self.backup_upd)
    }

    /// Copy the redacted temp to the `upd` tree, move the original to the `org` tree
    /// (timestamped when the name is taken) and put the redacted file in place.
    fn commit(&self, original: &Path, redacted_temp: &Path) -> Result<PathBuf, RedactionError> {
        let relative = self.relative(original)?;
        let upd = self.backup_upd.join(relative);
        if let Some(parent) = upd.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(redacted_temp, &upd)?;

        let mut org = self.backup_org.join(relative);
        if org.exists() {
            let stem = org
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let name = match org.extension() {
                Some(ext) => format!("{stem}_{}.{}", file_timestamp()?, ext.to_string_lossy()),
                None => format!("{stem}_{}", file_timestamp()?),
            };
            org.set_file_name(name);
        }
        move_path(original, &org)?;
        move_path(redacted_temp, original)?;
        log::info!(
            "Redacted {}. Original moved to {}, updated copy saved to {}",
            original.display(),
            org.display(),
            upd.display()
        );
        Ok(org)
    }
}

pub struct Redactor {
    candidates: Regex,
    canonical: FxHashMap<String, String>,
    ignore: Regex,
    patterns: FxHashMap<String, NamePattern>,
    approval: Approval,
}

impl Redactor {
    pub fn new(names: &NameList, approval: Approval) -> Result<Self, RedactionError> {
        let mut canonical = FxHashMap::default();
        for name in names.all_names() {
            let name = name.trim().to_string();
            if !name.is_empty() {
                canonical.insert(name.to_lowercase(), name);
            }
        }
        // longest alternatives first so the leftmost match is also the longest
        let mut keys: Vec<&String> = canonical.keys().collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let alternation = if keys.is_empty() {
            // never matches
            String::from(r"[^\s\S]")
        } else {
            keys.iter()
                .map(|k| regex::escape(k))
                .collect::<Vec<_>>()
                .join("|")
        };
        let candidates = RegexBuilder::new(&alternation)
            .case_insensitive(true)
            .size_limit(1 << 28)
            .dfa_size_limit(1 << 28)
            .build()?;

        let ignore = RegexBuilder::new(&format!(
            r"\b(?:{})\b",
            IGNORE_WORDS
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|")
        ))
        .case_insensitive(true)
        .build()?;

        Ok(Self {
            candidates,
            canonical,
            ignore,
            patterns: FxHashMap::default(),
            approval,
        })
    }

    /// Distinct candidate names in `text`, longest first
    pub fn find_candidates(&self, text: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .candidates
            .find_iter(text)
            .filter_map(|m| self.canonical.get(&m.as_str().to_lowercase()).cloned())
            .collect::<FxHashSet<String>>()
            .into_iter()
            .collect();
        found.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        found
    }

    pub fn strip_ignored(&self, text: &str) -> String {
        self.ignore.replace_all(text, " ").to_string()
    }

    fn pattern(&mut self, raw_name: &str) -> Result<NamePattern, RedactionError> {
        if let Some(pattern) = self.patterns.get(raw_name) {
            return Ok(pattern.clone());
        }
        let pattern = compiled_name_pattern(raw_name)?;
        self.patterns.insert(raw_name.to_string(), pattern.clone());
        Ok(pattern)
    }

    /// Redact one text value, returning the new text and whether it changed
    pub fn redact_text(&mut self, text: &str, file: &Path) -> Result<(String, bool), RedactionError> {
        let mut current = text.to_string();
        let mut changed = false;
        for raw_name in self.find_candidates(text) {
            let pattern = self.pattern(&raw_name)?;
            let stripped = self.strip_ignored(&current);
            if !pattern.is_match(&stripped) {
                continue;
            }
            if !self.approval.approve(&current, &stripped, &raw_name, file)? {
                continue;
            }
            let (next, did) = pattern.replace_all(&current);
            if did {
                current = next;
                changed = true;
            }
        }
        Ok((current, changed))
    }

    fn redact_value(&mut self, value: &mut Value, file: &Path) -> Result<bool, RedactionError> {
        let mut changed = false;
        match value {
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    changed |= self.redact_value(v, file)?;
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    changed |= self.redact_value(v, file)?;
                }
            }
            Value::String(s) => {
                let (next, did) = self.redact_text(s, file)?;
                if did {
                    *s = next;
                    changed = true;
                }
            }
            _ => (),
        }
        Ok(changed)
    }

    pub fn process_tsv(&mut self, file: &Path, layout: &BackupLayout) -> Result<bool, RedactionError> {
        let temp = PathBuf::from(format!("{}.tmp", file.display()));
        let mut changed = false;
        {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .flexible(true)
                .from_path(file)?;
            let mut writer = csv::WriterBuilder::new()
                .delimiter(b'\t')
                .terminator(csv::Terminator::Any(b'\n'))
                .flexible(true)
                .from_path(&temp)?;
            for record in reader.records() {
                let record = record?;
                let mut row = Vec::with_capacity(record.len());
                for cell in record.iter() {
                    let (next, did) = self.redact_text(cell, file)?;
                    changed |= did;
                    row.push(next);
                }
                writer.write_record(&row)?;
            }
            writer.flush()?;
        }

        if changed {
            layout.commit(file, &temp)?;
        } else {
            std::fs::remove_file(&temp)?;
            log::info!(" - No changes needed in TSV file.");
        }
        Ok(changed)
    }

    pub fn process_json(&mut self, file: &Path, layout: &BackupLayout) -> Result<bool, RedactionError> {
        let text = std::fs::read_to_string(file)?;
        let mut data: Value = match serde_json::from_str(&text) {
            Ok(data) => data,
            Err(e) => {
                log::error!(" - Error: Invalid JSON file {}: {e}", file.display());
                return Ok(false);
            }
        };
        if !self.redact_value(&mut data, file)? {
            log::info!(" - No changes needed in JSON file.");
            return Ok(false);
        }

        let temp = PathBuf::from(format!("{}.tmp.json", file.display()));
        {
            let out = BufWriter::new(File::create(&temp)?);
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut serializer = serde_json::Serializer::with_formatter(out, formatter);
            data.serialize(&mut serializer)?;
            serializer.into_inner().flush()?;
        }
        layout.commit(file, &temp)?;
        Ok(true)
    }

    /// Redact every `.tsv` and `.json` below the input folder; returns how many changed
    pub fn redact_tree(&mut self, layout: &BackupLayout) -> Result<usize, RedactionError> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&layout.input_folder).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() || layout.is_backup(entry.path()) {
                continue;
            }
            let extension = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if extension == "tsv" || extension == "json" {
                files.push((entry.into_path(), extension));
            }
        }

        let mut total = 0;
        for (file, extension) in files {
            log::info!("Processing {}...", file.display());
            let changed = match extension.as_str() {
                "tsv" => self.process_tsv(&file, layout)?,
                _ => self.process_json(&file, layout)?,
            };
            if changed {
                total += 1;
            }
        }
        log::info!("Total files modified: {total}");
        Ok(total)
    }
}
