//! Split a recording into sub-files wherever the signal goes flat for long enough.
//!
//! The recording is read in chunks of whole data records. A chunk whose ordinary signals are
//! all (physically) zero is a gap chunk. A run of gap chunks at least `gap_sec` long closes
//! the current segment; shorter runs are kept inside the segment. Samples are copied as
//! stored, so segments are bit-exact copies of the source records they cover. Segment times
//! of an EDF+D source follow the onsets in its time-keeping annotations.
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::annotation::Annotation;
use super::edf_header::{EdfHeader, FileType, SignalHeader};
use super::edf_reader::EdfReader;
use super::edf_writer::{EdfWriter, WriterSetup};
use super::error::SplitterError;
use super::worker_status::{Phase, WorkerStatus};

#[derive(Debug, Clone)]
pub struct SplitOptions {
    pub gap_sec: f64,
    pub chunk_sec: f64,
    pub threshold: f64,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            gap_sec: 10.0,
            chunk_sec: 1.0,
            threshold: 1e-9,
        }
    }
}

/// Summary of one written segment. Times are seconds from the source start.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub index: usize,
    pub start_sec: f64,
    pub end_sec: f64,
    pub records: u64,
}

/// Digital samples of a run of records, one (records x samples_per_record) matrix per
/// ordinary signal
#[derive(Debug)]
struct Chunk {
    records: usize,
    samples: Vec<Array2<i16>>,
}

impl Chunk {
    fn read(
        reader: &mut EdfReader,
        ordinary: &[usize],
        first: u64,
        count: u64,
    ) -> Result<Self, SplitterError> {
        let mut per_signal = reader.read_records_digital(first, count)?;
        let mut samples = Vec::with_capacity(ordinary.len());
        for signal in ordinary {
            let spr = reader.header().signals[*signal].samples_per_record;
            let data = std::mem::take(&mut per_signal[*signal]);
            samples.push(Array2::from_shape_vec((count as usize, spr), data)?);
        }
        Ok(Self {
            records: count as usize,
            samples,
        })
    }

    fn is_gap(&self, params: &[SignalHeader], threshold: f64) -> bool {
        self.samples
            .iter()
            .zip(params)
            .all(|(matrix, param)| matrix.iter().all(|d| param.to_physical(*d).abs() < threshold))
    }

    fn write_into(&self, writer: &mut EdfWriter) -> Result<(), SplitterError> {
        for record in 0..self.records {
            let rows: Vec<Vec<i16>> = self
                .samples
                .iter()
                .map(|matrix| matrix.row(record).to_vec())
                .collect();
            let slices: Vec<&[i16]> = rows.iter().map(|row| row.as_slice()).collect();
            writer.write_record(&slices)?;
        }
        Ok(())
    }
}

/// A segment currently being written
struct OpenSegment {
    writer: EdfWriter,
    index: usize,
    start_sec: f64,
    end_sec: f64,
}

impl OpenSegment {
    fn open(
        header: &EdfHeader,
        params: &[SignalHeader],
        path: PathBuf,
        index: usize,
        start_sec: f64,
    ) -> Result<Self, SplitterError> {
        let (start, start_fraction) = header.start_with_offset(start_sec);
        let mut setup = WriterSetup::new(
            &header.patient,
            &header.recording,
            start,
            header.record_duration,
            params.to_vec(),
        );
        setup.start_fraction = start_fraction;
        log::info!(
            "Started segment {index} at t={start_sec}s: {}",
            path.display()
        );
        Ok(Self {
            writer: EdfWriter::create(&path, setup)?,
            index,
            start_sec,
            end_sec: start_sec,
        })
    }

    fn close(mut self, annotations: &[Annotation]) -> Result<SegmentInfo, SplitterError> {
        let records = self.writer.records_written();
        let end_sec = self.end_sec;
        for annotation in annotations
            .iter()
            .filter(|a| a.onset >= self.start_sec && a.onset < end_sec)
        {
            self.writer.add_annotation(annotation.shifted(-self.start_sec));
        }
        let path = self.writer.path().to_path_buf();
        self.writer.finish()?;
        log::info!(
            "Closed segment {} at t={end_sec}s ({records} records)",
            self.index
        );
        Ok(SegmentInfo {
            path,
            index: self.index,
            start_sec: self.start_sec,
            end_sec,
            records,
        })
    }
}

/// Split `input` into `<stem>_part<N>.edf` files in `output_dir`.
pub fn split_edf(
    input: &Path,
    output_dir: &Path,
    options: &SplitOptions,
    tx: &Sender<WorkerStatus>,
    worker_id: &usize,
) -> Result<Vec<SegmentInfo>, SplitterError> {
    if !(options.gap_sec > 0.0 && options.chunk_sec > 0.0 && options.threshold >= 0.0) {
        return Err(SplitterError::BadOptions(format!(
            "gap {} s, chunk {} s, threshold {}",
            options.gap_sec, options.chunk_sec, options.threshold
        )));
    }
    std::fs::create_dir_all(output_dir)?;

    let mut reader = EdfReader::open(input)?;
    let header = reader.header().clone();
    let ordinary = header.ordinary_signals();
    if ordinary.is_empty() {
        return Err(SplitterError::NoSignals(input.to_path_buf()));
    }
    let params: Vec<SignalHeader> = ordinary
        .iter()
        .map(|idx| header.signals[*idx].clone())
        .collect();

    let record_duration = header.record_duration;
    let chunk_records = ((options.chunk_sec / record_duration).round() as u64).max(1);
    let gap_chunks = ((options.gap_sec / options.chunk_sec).floor() as u64).max(1);
    let annotations = reader.read_annotations()?;
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let total = reader.num_records();
    let onsets = if header.file_type() == FileType::EdfPlusDiscontinuous {
        reader.record_onsets()?
    } else {
        (0..total).map(|r| r as f64 * record_duration).collect()
    };
    log::info!(
        "Splitting {} ({} s) in chunks of {chunk_records} records; gap closes after {gap_chunks} chunks",
        input.display(),
        header.duration_secs()
    );

    let mut segments = Vec::new();
    let mut current: Option<OpenSegment> = None;
    let mut pending: Vec<Chunk> = Vec::new();
    let mut zero_count: u64 = 0;

    tx.send(WorkerStatus::new(0.0, &stem, *worker_id, Phase::Read))?;
    let mut first = 0;
    while first < total {
        let count = chunk_records.min(total - first);
        let chunk = Chunk::read(&mut reader, &ordinary, first, count)?;

        if !chunk.is_gap(&params, options.threshold) {
            if current.is_none() {
                let index = segments.len() + 1;
                let path = output_dir.join(format!("{stem}_part{index}.edf"));
                current = Some(OpenSegment::open(
                    &header,
                    &params,
                    path,
                    index,
                    onsets[first as usize],
                )?);
            }
            if let Some(segment) = current.as_mut() {
                for held in pending.drain(..) {
                    held.write_into(&mut segment.writer)?;
                }
                chunk.write_into(&mut segment.writer)?;
                segment.end_sec = onsets[(first + count - 1) as usize] + record_duration;
            }
            zero_count = 0;
        } else if current.is_some() {
            zero_count += 1;
            if zero_count >= gap_chunks {
                if let Some(segment) = current.take() {
                    segments.push(segment.close(&annotations)?);
                }
                pending.clear();
                zero_count = 0;
            } else {
                pending.push(chunk);
            }
        }

        first += count;
        tx.send(WorkerStatus::new(
            first as f32 / total as f32,
            &stem,
            *worker_id,
            Phase::Write,
        ))?;
    }

    if let Some(segment) = current.take() {
        segments.push(segment.close(&annotations)?);
    }
    log::info!("Wrote {} segments from {}", segments.len(), input.display());
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf_writer::{EdfWriter, WriterSetup};
    use std::sync::mpsc;
    use time::macros::datetime;

    /// A signal whose physical values equal its digital values
    fn unit_signal(label: &str) -> SignalHeader {
        SignalHeader {
            label: label.to_string(),
            transducer: String::new(),
            physical_dimension: String::from("uV"),
            physical_min: -32768.0,
            physical_max: 32767.0,
            digital_min: -32768,
            digital_max: 32767,
            prefilter: String::new(),
            samples_per_record: 4,
            reserved: String::new(),
        }
    }

    /// One record per entry: `true` writes data, `false` writes zeros
    fn write_source(path: &Path, pattern: &[bool], annotations: &[Annotation]) {
        let setup = WriterSetup::new(
            "P-1 M 01-JAN-1970 X",
            "Startdate 01-MAR-2023 X X X",
            datetime!(2023-03-01 10:00:00),
            1.0,
            vec![unit_signal("EEG F3"), unit_signal("EEG F4")],
        );
        let mut writer = EdfWriter::create(path, setup).unwrap();
        for (idx, data) in pattern.iter().enumerate() {
            let value = if *data { idx as i16 + 1 } else { 0 };
            let samples = [value; 4];
            writer.write_record(&[&samples, &[0; 4]]).unwrap();
        }
        for annotation in annotations {
            writer.add_annotation(annotation.clone());
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_split_on_long_gaps() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("night.edf");
        let pattern = [
            true, true, true, false, false, true, true, false, false, false, false, true, false,
            false,
        ];
        write_source(
            &input,
            &pattern,
            &[
                Annotation::new(5.5, None, "Spike"),
                Annotation::new(8.5, None, "Lost"),
                Annotation::new(11.25, None, "Arousal"),
            ],
        );

        let (tx, _rx) = mpsc::channel();
        let options = SplitOptions {
            gap_sec: 3.0,
            ..Default::default()
        };
        let out = dir.path().join("parts");
        let segments = split_edf(&input, &out, &options, &tx, &0).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].path, out.join("night_part1.edf"));
        assert_eq!(segments[0].records, 7);
        assert_eq!((segments[0].start_sec, segments[0].end_sec), (0.0, 7.0));
        assert_eq!(segments[1].path, out.join("night_part2.edf"));
        assert_eq!(segments[1].records, 1);
        assert_eq!(segments[1].start_sec, 11.0);

        let mut first = EdfReader::open(&segments[0].path).unwrap();
        let mut source = EdfReader::open(&input).unwrap();
        assert_eq!(
            first.read_digital(0, 0, 28).unwrap(),
            source.read_digital(0, 0, 28).unwrap()
        );
        assert_eq!(
            first.read_annotations().unwrap(),
            vec![Annotation::new(5.5, None, "Spike")]
        );

        let mut second = EdfReader::open(&segments[1].path).unwrap();
        assert_eq!(second.header().start, datetime!(2023-03-01 10:00:11));
        assert_eq!(second.header().patient, "P-1 M 01-JAN-1970 X");
        assert_eq!(second.read_digital(1, 0, 4).unwrap(), vec![0; 4]);
        assert_eq!(second.read_digital(0, 0, 4).unwrap(), vec![12; 4]);
        assert_eq!(
            second.read_annotations().unwrap(),
            vec![Annotation::new(0.25, None, "Arousal")]
        );
    }

    /// Mark `path` as EDF+D and move the time-keeping onset of each listed record
    fn make_discontinuous(path: &Path, jumps: &[(u64, u64)]) {
        let mut bytes = std::fs::read(path).unwrap();
        bytes[192..197].copy_from_slice(b"EDF+D");
        for (record, onset) in jumps {
            let old = format!("+{record}\x14\x14\0").into_bytes();
            let new = format!("+{onset}\x14\x14\0").into_bytes();
            let at = bytes
                .windows(old.len())
                .position(|w| w == old.as_slice())
                .unwrap();
            bytes[at..at + new.len()].copy_from_slice(&new);
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_discontinuous_segments_follow_record_onsets() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ward.edf");
        let pattern = [true, true, true, false, false, false, false, true, true];
        write_source(&input, &pattern, &[]);
        make_discontinuous(&input, &[(7, 100), (8, 101)]);

        let (tx, _rx) = mpsc::channel();
        let options = SplitOptions {
            gap_sec: 3.0,
            ..Default::default()
        };
        let out = dir.path().join("parts");
        let segments = split_edf(&input, &out, &options, &tx, &0).unwrap();

        assert_eq!(segments.len(), 2);
        assert_eq!((segments[0].start_sec, segments[0].end_sec), (0.0, 3.0));
        assert_eq!((segments[1].start_sec, segments[1].end_sec), (100.0, 102.0));
        assert_eq!(segments[1].records, 2);

        let second = EdfReader::open(&segments[1].path).unwrap();
        assert_eq!(second.header().start, datetime!(2023-03-01 10:01:40));
    }

    #[test]
    fn test_flat_recording_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("flat.edf");
        write_source(&input, &[false; 5], &[]);

        let (tx, _rx) = mpsc::channel();
        let segments =
            split_edf(&input, dir.path(), &SplitOptions::default(), &tx, &0).unwrap();
        assert!(segments.is_empty());
        assert!(!dir.path().join("flat_part1.edf").exists());
    }

    #[test]
    fn test_rejects_bad_options() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel();
        let options = SplitOptions {
            chunk_sec: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            split_edf(&dir.path().join("x.edf"), dir.path(), &options, &tx, &0),
            Err(SplitterError::BadOptions(_))
        ));
    }
}
