use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use time::macros::format_description;
use walkdir::WalkDir;

use super::edf_header::EdfHeader;
use super::edf_reader::EdfReader;
use super::error::ScannerError;

/// Header-level description of one EDF file. Every field is empty when the file could
/// not be parsed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EdfMetadata {
    pub subject_name: Option<String>,
    pub patient_code: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<String>,
    pub patient_additional: Option<String>,
    pub session_start: Option<String>,
    pub technician: Option<String>,
    pub equipment: Option<String>,
    pub admin_code: Option<String>,
    pub file_duration: Option<f64>,
    pub num_signals: Option<usize>,
    pub num_data_records: Option<i64>,
    pub data_record_duration: Option<f64>,
    pub signal_labels: Option<Vec<String>>,
    pub sampling_rates: Option<Vec<f64>>,
    pub physical_dimension: Option<Vec<String>>,
    pub transducer: Option<Vec<String>>,
    pub pre_filter: Option<Vec<String>>,
    pub signal_reserved: Option<Vec<String>>,
    pub physical_min: Option<Vec<f64>>,
    pub physical_max: Option<Vec<f64>>,
    pub digital_min: Option<Vec<i32>>,
    pub digital_max: Option<Vec<i32>>,
    pub header_reserved: Option<String>,
}

impl EdfMetadata {
    pub fn from_header(header: &EdfHeader) -> Result<Self, ScannerError> {
        let start_format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        let mut metadata = Self {
            session_start: Some(header.start.format(&start_format)?),
            file_duration: Some(header.duration_secs()),
            num_signals: Some(header.signals.len()),
            num_data_records: Some(header.num_data_records),
            data_record_duration: Some(header.record_duration),
            header_reserved: Some(header.reserved.clone()),
            ..Default::default()
        };

        match header.patient_info() {
            Some(patient) => {
                metadata.subject_name = Some(patient.name);
                metadata.patient_code = Some(patient.code);
                metadata.gender = Some(patient.sex);
                metadata.birth_date = Some(patient.birthdate);
                metadata.patient_additional = Some(patient.additional);
            }
            None => metadata.subject_name = Some(header.patient.clone()),
        }
        if let Some(recording) = header.recording_info() {
            metadata.technician = Some(recording.technician);
            metadata.equipment = Some(recording.equipment);
            metadata.admin_code = Some(recording.admin_code);
        }

        let signals = &header.signals;
        metadata.signal_labels = Some(signals.iter().map(|s| s.label.clone()).collect());
        metadata.sampling_rates = Some(
            signals
                .iter()
                .map(|s| s.sample_frequency(header.record_duration))
                .collect(),
        );
        metadata.physical_dimension =
            Some(signals.iter().map(|s| s.physical_dimension.clone()).collect());
        metadata.transducer = Some(signals.iter().map(|s| s.transducer.clone()).collect());
        metadata.pre_filter = Some(signals.iter().map(|s| s.prefilter.clone()).collect());
        metadata.signal_reserved = Some(signals.iter().map(|s| s.reserved.clone()).collect());
        metadata.physical_min = Some(signals.iter().map(|s| s.physical_min).collect());
        metadata.physical_max = Some(signals.iter().map(|s| s.physical_max).collect());
        metadata.digital_min = Some(signals.iter().map(|s| s.digital_min).collect());
        metadata.digital_max = Some(signals.iter().map(|s| s.digital_max).collect());
        Ok(metadata)
    }

    /// Flatten to table cells; list fields are rendered as JSON arrays
    fn cells(&self) -> Result<Vec<String>, ScannerError> {
        fn text<T: ToString>(value: &Option<T>) -> String {
            value.as_ref().map(|v| v.to_string()).unwrap_or_default()
        }
        fn list<T: Serialize>(value: &Option<Vec<T>>) -> Result<String, ScannerError> {
            match value {
                Some(v) => Ok(serde_json::to_string(v)?),
                None => Ok(String::new()),
            }
        }
        Ok(vec![
            text(&self.subject_name),
            text(&self.patient_code),
            text(&self.gender),
            text(&self.birth_date),
            text(&self.patient_additional),
            text(&self.session_start),
            text(&self.technician),
            text(&self.equipment),
            text(&self.admin_code),
            text(&self.file_duration),
            text(&self.num_signals),
            text(&self.num_data_records),
            text(&self.data_record_duration),
            list(&self.signal_labels)?,
            list(&self.sampling_rates)?,
            list(&self.physical_dimension)?,
            list(&self.transducer)?,
            list(&self.pre_filter)?,
            list(&self.signal_reserved)?,
            list(&self.physical_min)?,
            list(&self.physical_max)?,
            list(&self.digital_min)?,
            list(&self.digital_max)?,
            text(&self.header_reserved),
        ])
    }
}

const COLUMNS: [&str; 27] = [
    "subject_name",
    "patient_code",
    "gender",
    "birth_date",
    "patient_additional",
    "session_start",
    "technician",
    "equipment",
    "admin_code",
    "file_duration",
    "num_signals",
    "num_data_records",
    "data_record_duration",
    "signal_labels",
    "sampling_rates",
    "physical_dimension",
    "transducer",
    "pre_filter",
    "signal_reserved",
    "physical_min",
    "physical_max",
    "digital_min",
    "digital_max",
    "header_reserved",
    "file_name",
    "file_path",
    "file_size_bytes",
];

#[derive(Debug, Clone, Serialize)]
pub struct ScanRow {
    #[serde(flatten)]
    pub metadata: EdfMetadata,
    pub file_name: String,
    pub file_path: String,
    pub file_size_bytes: u64,
}

pub fn extract_edf_info(path: &Path) -> Result<EdfMetadata, ScannerError> {
    let reader = EdfReader::open(path)?;
    EdfMetadata::from_header(reader.header())
}

/// Describe every `.edf` file below `folder`
pub fn scan_folder(folder: &Path) -> Result<Vec<ScanRow>, ScannerError> {
    let mut rows = Vec::new();
    for entry in WalkDir::new(folder).sort_by_file_name() {
        let entry = entry?;
        let is_edf = entry
            .path()
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("edf"));
        if !entry.file_type().is_file() || !is_edf {
            continue;
        }
        log::info!("Checking file <{}>", entry.path().display());
        let metadata = match extract_edf_info(entry.path()) {
            Ok(metadata) => metadata,
            Err(e) => {
                log::warn!("Error processing file {}: {e}", entry.path().display());
                EdfMetadata::default()
            }
        };
        rows.push(ScanRow {
            metadata,
            file_name: entry.file_name().to_string_lossy().to_string(),
            file_path: entry.path().to_string_lossy().to_string(),
            file_size_bytes: entry.metadata()?.len(),
        });
    }
    Ok(rows)
}

/// Save scan rows as `.csv`, `.txt` (tab separated) or `.json`, chosen by extension
pub fn write_scan(rows: &[ScanRow], output: &Path) -> Result<(), ScannerError> {
    let extension = output
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let delimiter = match extension.as_str() {
        "csv" => b',',
        "txt" => b'\t',
        "json" => {
            let file = BufWriter::new(File::create(output)?);
            let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
            let mut serializer = serde_json::Serializer::with_formatter(file, formatter);
            rows.serialize(&mut serializer)?;
            log::info!("Data has been saved to {}", output.display());
            return Ok(());
        }
        _ => return Err(ScannerError::UnsupportedFormat(extension)),
    };

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_path(output)?;
    writer.write_record(COLUMNS)?;
    for row in rows {
        let mut cells = row.metadata.cells()?;
        cells.push(row.file_name.clone());
        cells.push(row.file_path.clone());
        cells.push(row.file_size_bytes.to_string());
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    log::info!("Data has been saved to {}", output.display());
    Ok(())
}
