use byteorder::{LittleEndian, WriteBytesExt};
use fxhash::FxHashMap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use time::PrimitiveDateTime;

use super::annotation::{encode_tal, encode_timekeeping, Annotation};
use super::constants::*;
use super::edf_header::{fit_number, EdfHeader, SignalHeader};
use super::error::EdfWriterError;

/// Byte offset of the number-of-records field in the main header
const RECORD_COUNT_OFFSET: u64 = 236;

/// Everything needed to lay out a new EDF+C file
#[derive(Debug, Clone)]
pub struct WriterSetup {
    pub patient: String,
    pub recording: String,
    pub start: PrimitiveDateTime,
    /// Sub-second part of the start time, carried by the time-keeping TALs
    pub start_fraction: f64,
    pub record_duration: f64,
    pub signals: Vec<SignalHeader>,
    pub annotation_slots: usize,
}

impl WriterSetup {
    pub fn new(
        patient: &str,
        recording: &str,
        start: PrimitiveDateTime,
        record_duration: f64,
        signals: Vec<SignalHeader>,
    ) -> Self {
        Self {
            patient: patient.to_string(),
            recording: recording.to_string(),
            start,
            start_fraction: 0.0,
            record_duration,
            signals,
            annotation_slots: DEFAULT_ANNOTATION_SLOTS,
        }
    }
}

/// Streaming EDF+C writer. Records are appended one at a time; annotations are queued and
/// placed into the annotation signal when the writer is finished.
#[derive(Debug)]
pub struct EdfWriter {
    path: PathBuf,
    file: BufWriter<File>,
    header: EdfHeader,
    n_ordinary: usize,
    annotation_bytes: usize,
    annotation_slots: usize,
    start_fraction: f64,
    records_written: u64,
    pending: Vec<Annotation>,
}

impl EdfWriter {
    pub fn create(path: &Path, setup: WriterSetup) -> Result<Self, EdfWriterError> {
        let mut signals: Vec<SignalHeader> = setup
            .signals
            .into_iter()
            .filter(|s| !s.is_annotation())
            .collect();
        if signals.is_empty() {
            return Err(EdfWriterError::NoSignals);
        }
        if !(setup.record_duration > 0.0 && setup.record_duration.is_finite()) {
            return Err(EdfWriterError::BadRecordDuration(setup.record_duration));
        }

        let n_ordinary = signals.len();
        let annotation_slots = setup.annotation_slots.max(1);
        let mut annotation_bytes = TIMEKEEPING_BYTES + annotation_slots * ANNOTATION_SLOT_BYTES;
        annotation_bytes += annotation_bytes % BYTES_PER_SAMPLE;
        signals.push(SignalHeader::annotation(annotation_bytes));

        let header = EdfHeader::new(
            &setup.patient,
            &setup.recording,
            setup.start,
            EDF_PLUS_CONTINUOUS,
            setup.record_duration,
            signals,
        );
        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(&header.to_bytes()?)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            n_ordinary,
            annotation_bytes,
            annotation_slots,
            start_fraction: setup.start_fraction,
            records_written: 0,
            pending: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Append one data record. `samples` holds one slice per ordinary signal.
    pub fn write_record(&mut self, samples: &[&[i16]]) -> Result<(), EdfWriterError> {
        if samples.len() != self.n_ordinary {
            return Err(EdfWriterError::SignalCountMismatch(
                samples.len(),
                self.n_ordinary,
            ));
        }
        for (signal, data) in samples.iter().enumerate() {
            let expected = self.header.signals[signal].samples_per_record;
            if data.len() != expected {
                return Err(EdfWriterError::SampleCountMismatch {
                    signal,
                    given: data.len(),
                    expected,
                });
            }
        }
        for data in samples {
            for sample in data.iter() {
                self.file.write_i16::<LittleEndian>(*sample)?;
            }
        }

        let onset = self.start_fraction + self.records_written as f64 * self.header.record_duration;
        let mut block = encode_timekeeping(onset);
        block.resize(self.annotation_bytes, 0);
        self.file.write_all(&block)?;
        self.records_written += 1;
        Ok(())
    }

    /// Queue an annotation. Onset is relative to the start of the recording.
    pub fn add_annotation(&mut self, annotation: Annotation) {
        self.pending.push(annotation);
    }

    /// Place queued annotations, patch the record count and close the file.
    /// Returns the number of records written.
    pub fn finish(mut self) -> Result<u64, EdfWriterError> {
        self.file.flush()?;
        let blocks = self.layout_annotations();

        let record_size = self.header.record_size_bytes() as u64;
        let annotation_offset = (self.header.record_size_bytes() - self.annotation_bytes) as u64;
        let mut records: Vec<&u64> = blocks.keys().collect();
        records.sort();
        for record in records {
            let position = self.header.header_bytes as u64
                + record * record_size
                + annotation_offset;
            self.file.seek(SeekFrom::Start(position))?;
            self.file.write_all(&blocks[record])?;
        }

        let count = fit_number(self.records_written as f64, 8)?;
        self.file.seek(SeekFrom::Start(RECORD_COUNT_OFFSET))?;
        self.file.write_all(format!("{count:<8}").as_bytes())?;
        self.file.flush()?;
        Ok(self.records_written)
    }

    /// Annotation blocks of every record that received an annotation
    fn layout_annotations(&mut self) -> FxHashMap<u64, Vec<u8>> {
        let mut blocks: FxHashMap<u64, Vec<u8>> = FxHashMap::default();
        let mut used: FxHashMap<u64, usize> = FxHashMap::default();
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_by(|a, b| a.onset.total_cmp(&b.onset));

        for annotation in pending {
            let target = (annotation.onset / self.header.record_duration)
                .floor()
                .max(0.0) as u64;
            let record = (target..self.records_written)
                .find(|r| used.get(r).copied().unwrap_or(0) < self.annotation_slots);
            let Some(record) = record else {
                log::warn!(
                    "No free annotation slot for {:?} at {} s in {}; dropped",
                    annotation.description,
                    annotation.onset,
                    self.path.display()
                );
                continue;
            };

            let onset = annotation.onset + self.start_fraction;
            let overhead = encode_tal(onset, annotation.duration, &[""]).len();
            let text = truncate_utf8(
                &annotation.description,
                ANNOTATION_SLOT_BYTES.saturating_sub(overhead),
            );
            let tal = encode_tal(onset, annotation.duration, &[text]);

            let block = blocks.entry(record).or_insert_with(|| {
                encode_timekeeping(
                    self.start_fraction + record as f64 * self.header.record_duration,
                )
            });
            block.extend(tal);
            *used.entry(record).or_insert(0) += 1;
        }

        for block in blocks.values_mut() {
            block.resize(self.annotation_bytes, 0);
        }
        blocks
    }
}

/// Longest prefix of `text` no longer than `max` bytes ending on a char boundary
fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf_header::tests::eeg_signal;
    use crate::edf_reader::EdfReader;
    use time::macros::datetime;

    fn setup() -> WriterSetup {
        WriterSetup::new(
            "X X X X",
            "Startdate X X X X",
            datetime!(2024-01-31 23:59:59),
            0.5,
            vec![eeg_signal("EEG O1", 8)],
        )
    }

    #[test]
    fn test_layout_and_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.edf");
        let mut writer = EdfWriter::create(&path, setup()).unwrap();
        for _ in 0..4 {
            writer.write_record(&[&[1; 8]]).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 4);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[236..244], b"4       ");
        assert_eq!(&bytes[192..197], b"EDF+C");
        let reader = EdfReader::open(&path).unwrap();
        let header = reader.header();
        assert_eq!(header.signals.len(), 2);
        assert!(header.signals[1].is_annotation());
        // 24 + 114 = 138 bytes of annotations per record
        assert_eq!(header.signals[1].samples_per_record, 69);
        assert_eq!(bytes.len(), 768 + 4 * (16 + 138));
    }

    #[test]
    fn test_annotation_slots_overflow_to_next_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.edf");
        let mut writer = EdfWriter::create(&path, setup()).unwrap();
        for _ in 0..2 {
            writer.write_record(&[&[0; 8]]).unwrap();
        }
        writer.add_annotation(Annotation::new(0.1, None, "first"));
        writer.add_annotation(Annotation::new(0.2, Some(1.0), "second"));
        writer.add_annotation(Annotation::new(0.3, None, "third"));
        writer.finish().unwrap();

        let mut reader = EdfReader::open(&path).unwrap();
        let annotations = reader.read_annotations().unwrap();
        let texts: Vec<&str> = annotations.iter().map(|a| a.description.as_str()).collect();
        // two records with one slot each, the third annotation has nowhere to go
        assert_eq!(texts, vec!["first", "second"]);
        assert_eq!(annotations[1].duration, Some(1.0));
        assert_eq!(reader.record_onsets().unwrap(), vec![0.0, 0.5]);
    }

    #[test]
    fn test_long_text_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.edf");
        let mut writer = EdfWriter::create(&path, setup()).unwrap();
        writer.write_record(&[&[0; 8]]).unwrap();
        writer.add_annotation(Annotation::new(0.0, None, &"é".repeat(200)));
        writer.finish().unwrap();

        let mut reader = EdfReader::open(&path).unwrap();
        let annotations = reader.read_annotations().unwrap();
        assert_eq!(annotations.len(), 1);
        assert!(annotations[0].description.len() < 114);
        assert!(annotations[0].description.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_rejects_bad_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = EdfWriter::create(&dir.path().join("out.edf"), setup()).unwrap();
        assert!(matches!(
            writer.write_record(&[&[0; 7]]),
            Err(EdfWriterError::SampleCountMismatch { .. })
        ));
        assert!(matches!(
            writer.write_record(&[&[0; 8], &[0; 8]]),
            Err(EdfWriterError::SignalCountMismatch(2, 1))
        ));
    }

    #[test]
    fn test_start_fraction_in_timekeeping() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.edf");
        let mut s = setup();
        s.start_fraction = 0.25;
        let mut writer = EdfWriter::create(&path, s).unwrap();
        writer.write_record(&[&[0; 8]]).unwrap();
        writer.write_record(&[&[0; 8]]).unwrap();
        writer.finish().unwrap();

        let mut reader = EdfReader::open(&path).unwrap();
        assert_eq!(reader.record_onsets().unwrap(), vec![0.25, 0.75]);
    }
}
