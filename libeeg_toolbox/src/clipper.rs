use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::mpsc::Sender;
use time::macros::format_description;

use super::edf_header::{EdfHeader, SignalHeader};
use super::edf_reader::EdfReader;
use super::edf_writer::{EdfWriter, WriterSetup};
use super::error::ClipperError;
use super::worker_status::{Phase, WorkerStatus};

/// Sentinel used by clip requests for "not set"
const UNSET: f64 = -1.0;

/// The `file_info` block of a clip request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipFileInfo {
    #[serde(default)]
    pub clip_begin_sec: Option<f64>,
    #[serde(default)]
    pub clip_end_sec: Option<f64>,
    #[serde(default)]
    pub selected_signals: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClipRequest {
    pub file_info: ClipFileInfo,
}

impl ClipRequest {
    pub fn read_file(path: &Path) -> Result<Self, ClipperError> {
        let json_str = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str::<Self>(&json_str)?)
    }
}

/// Resolve the requested range against the file duration
pub fn resolve_range(info: &ClipFileInfo, duration: f64) -> Result<(f64, f64), ClipperError> {
    let begin = match info.clip_begin_sec {
        Some(value) if value != UNSET => value,
        _ => 0.0,
    };
    let end = match info.clip_end_sec {
        Some(value) if value != UNSET => value,
        _ => duration,
    };
    let begin = begin.clamp(0.0, duration.max(0.0));
    let end = end.clamp(0.0, duration.max(0.0));
    if end <= begin {
        return Err(ClipperError::InvalidRange(begin, end));
    }
    Ok((begin, end))
}

/// Indices of the ordinary signals named in `selected`. An empty selection means all.
pub fn select_signals(header: &EdfHeader, selected: &[String]) -> Result<Vec<usize>, ClipperError> {
    let ordinary = header.ordinary_signals();
    if selected.is_empty() {
        return Ok(ordinary);
    }
    let wanted: Vec<&str> = selected.iter().map(|s| s.trim()).collect();
    let indices: Vec<usize> = ordinary
        .into_iter()
        .filter(|idx| wanted.contains(&header.signals[*idx].label.trim()))
        .collect();
    if indices.is_empty() {
        return Err(ClipperError::NoSignalsSelected);
    }
    Ok(indices)
}

/// Render seconds as `1d 02:34:56.789`, dropping the day part when zero
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let days = total_ms / 86_400_000;
    let hours = (total_ms / 3_600_000) % 24;
    let minutes = (total_ms / 60_000) % 60;
    let secs = (total_ms / 1000) % 60;
    let millis = total_ms % 1000;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{secs:02}.{millis:03}")
    } else {
        format!("{hours:02}:{minutes:02}:{secs:02}.{millis:03}")
    }
}

/// Copy the selected signals of `input` between the requested times into `output`.
/// Returns the number of records written.
pub fn clip_edf(
    input: &Path,
    output: &Path,
    request: &ClipRequest,
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<u64, ClipperError> {
    let mut reader = EdfReader::open(input)?;
    let header = reader.header().clone();
    let duration = header.duration_secs();
    let (begin, end) = resolve_range(&request.file_info, duration)?;
    let indices = select_signals(&header, &request.file_info.selected_signals)?;
    log::info!(
        "Clipping {} from {} to {} ({} of {} signals)",
        input.display(),
        format_timestamp(begin),
        format_timestamp(end),
        indices.len(),
        header.ordinary_signals().len()
    );

    let record_duration = header.record_duration;
    let n_records = (((end - begin) / record_duration).floor() as u64).max(1);
    let params: Vec<SignalHeader> = indices
        .iter()
        .map(|idx| header.signals[*idx].clone())
        .collect();
    let first_samples: Vec<u64> = params
        .iter()
        .map(|p| (begin * p.sample_frequency(record_duration)).floor() as u64)
        .collect();

    let (start, start_fraction) = header.start_with_offset(begin);
    let mut setup = WriterSetup::new(
        &header.patient,
        &header.recording,
        start,
        record_duration,
        params.clone(),
    );
    setup.start_fraction = start_fraction;
    let mut writer = EdfWriter::create(output, setup)?;

    if header.file_type().is_plus() {
        let clip_length = end - begin;
        let mut kept = 0;
        for annotation in reader.read_annotations()? {
            let moved = annotation.shifted(-begin);
            if moved.onset >= 0.0 && moved.onset < clip_length {
                writer.add_annotation(moved);
                kept += 1;
            }
        }
        log::info!("Carried over {kept} annotations");
    }

    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    tx.send(WorkerStatus::new(0.0, &name, *worker_id, Phase::Write))?;
    for record in 0..n_records {
        let mut rows: Vec<Vec<i16>> = Vec::with_capacity(params.len());
        for (pos, signal) in indices.iter().enumerate() {
            let spr = params[pos].samples_per_record;
            let start_sample = first_samples[pos] + record * spr as u64;
            let mut samples = reader.read_digital(*signal, start_sample, spr)?;
            samples.resize(spr, params[pos].digital_zero());
            rows.push(samples);
        }
        let slices: Vec<&[i16]> = rows.iter().map(|row| row.as_slice()).collect();
        writer.write_record(&slices)?;
        tx.send(WorkerStatus::new(
            (record + 1) as f32 / n_records as f32,
            &name,
            *worker_id,
            Phase::Write,
        ))?;
    }

    let written = writer.finish()?;
    log::info!("Clipped EDF saved to {}", output.display());
    Ok(written)
}

#[derive(Debug, Serialize)]
struct SignalSummary {
    label: String,
    sample_rate: f64,
    physical_dimension: String,
    physical_min: f64,
    physical_max: f64,
}

#[derive(Debug, Serialize)]
struct AnnotationSummary {
    onset: f64,
    duration: Option<f64>,
    description: String,
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct MetadataFileInfo {
    file_name: String,
    start_datetime: String,
    duration_sec: f64,
    duration: String,
    record_duration: f64,
    num_records: u64,
    clip_begin_sec: f64,
    clip_end_sec: f64,
    selected_signals: Vec<String>,
    signals: Vec<SignalSummary>,
    annotations: Vec<AnnotationSummary>,
}

#[derive(Debug, Serialize)]
struct ClipMetadata {
    file_info: MetadataFileInfo,
}

/// Describe `input` as JSON. The output doubles as a clip request covering the whole
/// file with every signal selected.
pub fn generate_edf_metadata(input: &Path, output: &Path) -> Result<(), ClipperError> {
    let mut reader = EdfReader::open(input)?;
    let header = reader.header().clone();
    let duration = header.duration_secs();
    let ordinary = header.ordinary_signals();
    let annotations = if header.file_type().is_plus() {
        reader.read_annotations()?
    } else {
        Vec::new()
    };
    let start_format = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");

    let metadata = ClipMetadata {
        file_info: MetadataFileInfo {
            file_name: input
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            start_datetime: header.start.format(&start_format)?,
            duration_sec: duration,
            duration: format_timestamp(duration),
            record_duration: header.record_duration,
            num_records: reader.num_records(),
            clip_begin_sec: 0.0,
            clip_end_sec: duration,
            selected_signals: ordinary
                .iter()
                .map(|idx| header.signals[*idx].label.clone())
                .collect(),
            signals: ordinary
                .iter()
                .map(|idx| {
                    let s = &header.signals[*idx];
                    SignalSummary {
                        label: s.label.clone(),
                        sample_rate: s.sample_frequency(header.record_duration),
                        physical_dimension: s.physical_dimension.clone(),
                        physical_min: s.physical_min,
                        physical_max: s.physical_max,
                    }
                })
                .collect(),
            annotations: annotations
                .into_iter()
                .map(|a| AnnotationSummary {
                    timestamp: format_timestamp(a.onset),
                    onset: a.onset,
                    duration: a.duration,
                    description: a.description,
                })
                .collect(),
        },
    };

    let file = BufWriter::new(File::create(output)?);
    serde_json::to_writer_pretty(file, &metadata)?;
    log::info!("Metadata saved to {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::Annotation;
    use std::path::PathBuf;
    use std::sync::mpsc;
    use time::macros::datetime;

    fn unit_signal(label: &str, samples_per_record: usize) -> SignalHeader {
        SignalHeader {
            label: label.to_string(),
            transducer: String::new(),
            physical_dimension: String::from("uV"),
            physical_min: -32768.0,
            physical_max: 32767.0,
            digital_min: -32768,
            digital_max: 32767,
            prefilter: String::new(),
            samples_per_record,
            reserved: String::new(),
        }
    }

    fn write_source(dir: &Path) -> PathBuf {
        let path = dir.join("source.edf");
        let setup = WriterSetup::new(
            "X X X X",
            "Startdate X X X X",
            datetime!(2022-11-05 08:00:00),
            1.0,
            vec![unit_signal("EEG A1", 4), unit_signal(" EEG A2 ", 2)],
        );
        let mut writer = EdfWriter::create(&path, setup).unwrap();
        for r in 0..6i16 {
            let a: Vec<i16> = (0..4).map(|i| r * 4 + i).collect();
            let b: Vec<i16> = (0..2).map(|i| 100 + r * 2 + i).collect();
            writer.write_record(&[&a, &b]).unwrap();
        }
        writer.add_annotation(Annotation::new(1.0, None, "Before"));
        writer.add_annotation(Annotation::new(2.0, Some(0.5), "Inside"));
        writer.add_annotation(Annotation::new(5.5, None, "After"));
        writer.finish().unwrap();
        path
    }

    fn request(begin: Option<f64>, end: Option<f64>, signals: &[&str]) -> ClipRequest {
        ClipRequest {
            file_info: ClipFileInfo {
                clip_begin_sec: begin,
                clip_end_sec: end,
                selected_signals: signals.iter().map(|s| s.to_string()).collect(),
            },
        }
    }

    #[test]
    fn test_resolve_range() {
        let info = request(Some(-1.0), None, &[]).file_info;
        assert_eq!(resolve_range(&info, 30.0).unwrap(), (0.0, 30.0));
        let info = request(Some(5.0), Some(100.0), &[]).file_info;
        assert_eq!(resolve_range(&info, 30.0).unwrap(), (5.0, 30.0));
        let info = request(Some(10.0), Some(10.0), &[]).file_info;
        assert!(matches!(
            resolve_range(&info, 30.0),
            Err(ClipperError::InvalidRange(_, _))
        ));
    }

    #[test]
    fn test_request_from_json() {
        let request: ClipRequest = serde_json::from_str(
            r#"{"file_info": {"clip_begin_sec": 12.5, "selected_signals": ["C3", "C4"], "extra": 1}}"#,
        )
        .unwrap();
        assert_eq!(request.file_info.clip_begin_sec, Some(12.5));
        assert_eq!(request.file_info.clip_end_sec, None);
        assert_eq!(request.file_info.selected_signals.len(), 2);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(3723.25), "01:02:03.250");
        assert_eq!(format_timestamp(86400.0 + 9296.789), "1d 02:34:56.789");
    }

    #[test]
    fn test_clip_rebases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let output = dir.path().join("clip.edf");
        let (tx, _rx) = mpsc::channel();

        let written = clip_edf(
            &source,
            &output,
            &request(Some(1.5), Some(4.0), &["EEG A2", "EEG A1"]),
            &tx,
            &0,
        )
        .unwrap();
        assert_eq!(written, 2);

        let mut reader = EdfReader::open(&output).unwrap();
        let header = reader.header().clone();
        assert_eq!(header.start, datetime!(2022-11-05 08:00:01));
        assert_eq!(header.record_duration, 1.0);
        assert_eq!(header.ordinary_signals().len(), 2);
        assert_eq!(
            reader.read_digital(0, 0, 8).unwrap(),
            (6..14).collect::<Vec<i16>>()
        );
        assert_eq!(reader.read_digital(1, 0, 4).unwrap(), vec![103, 104, 105, 106]);
        assert_eq!(reader.record_onsets().unwrap(), vec![0.5, 1.5]);
        let annotations = reader.read_annotations().unwrap();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].description, "Inside");
        // 0.5 s re-based onset plus the 0.5 s start fraction
        assert_eq!(annotations[0].onset, 1.0);
    }

    #[test]
    fn test_clip_pads_past_end() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let output = dir.path().join("tail.edf");
        let (tx, _rx) = mpsc::channel();

        clip_edf(&source, &output, &request(Some(5.5), Some(-1.0), &["EEG A1"]), &tx, &0).unwrap();

        let mut reader = EdfReader::open(&output).unwrap();
        assert_eq!(reader.num_records(), 1);
        assert_eq!(reader.read_digital(0, 0, 4).unwrap(), vec![22, 23, 0, 0]);
    }

    #[test]
    fn test_unknown_signal_selection() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(
            clip_edf(
                &source,
                &dir.path().join("none.edf"),
                &request(None, None, &["ECG"]),
                &tx,
                &0
            ),
            Err(ClipperError::NoSignalsSelected)
        ));
    }

    #[test]
    fn test_metadata_is_a_clip_request() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_source(dir.path());
        let output = dir.path().join("source.json");
        generate_edf_metadata(&source, &output).unwrap();

        let request = ClipRequest::read_file(&output).unwrap();
        assert_eq!(request.file_info.clip_end_sec, Some(6.0));
        assert_eq!(request.file_info.selected_signals, vec!["EEG A1", "EEG A2"]);
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(raw["file_info"]["start_datetime"], "2022-11-05T08:00:00");
        assert_eq!(raw["file_info"]["annotations"][1]["description"], "Inside");
    }
}
