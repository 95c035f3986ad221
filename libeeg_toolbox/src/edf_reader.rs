use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::annotation::{parse_record_annotations, Annotation};
use super::constants::BYTES_PER_SAMPLE;
use super::edf_header::EdfHeader;
use super::error::EdfReaderError;

/// Random access reader over the data records of an EDF/EDF+ file.
///
/// The record count stored in the header is reconciled with the file size on open, so
/// files left with a count of -1 by an interrupted writer are still readable.
#[derive(Debug)]
pub struct EdfReader {
    path: PathBuf,
    file: BufReader<File>,
    header: EdfHeader,
    record_size: usize,
    offsets: Vec<usize>,
}

impl EdfReader {
    pub fn open(path: &Path) -> Result<Self, EdfReaderError> {
        if !path.exists() {
            return Err(EdfReaderError::BadFilePath(path.to_path_buf()));
        }
        let mut file = BufReader::new(File::open(path)?);
        let mut header = EdfHeader::read_from(&mut file)?;
        let record_size = header.record_size_bytes();
        if record_size == 0 {
            return Err(EdfReaderError::NoRecords);
        }

        let file_size = file.get_ref().metadata()?.len();
        let data_bytes = file_size.saturating_sub(header.header_bytes as u64);
        let actual_records = (data_bytes / record_size as u64) as i64;
        if header.num_data_records != actual_records {
            log::warn!(
                "{} declares {} data records but holds {}; using {}",
                path.display(),
                header.num_data_records,
                actual_records,
                actual_records
            );
            header.num_data_records = actual_records;
        }
        let offsets = header.signal_offsets();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            record_size,
            offsets,
        })
    }

    pub fn header(&self) -> &EdfHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn num_records(&self) -> u64 {
        self.header.num_data_records.max(0) as u64
    }

    fn seek_record(&mut self, index: u64, byte_offset: usize) -> Result<(), EdfReaderError> {
        if index >= self.num_records() {
            return Err(EdfReaderError::BadRecord(index));
        }
        let position =
            self.header.header_bytes as u64 + index * self.record_size as u64 + byte_offset as u64;
        self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Raw bytes of one data record, all signals included
    pub fn read_record_raw(&mut self, index: u64) -> Result<Vec<u8>, EdfReaderError> {
        self.seek_record(index, 0)?;
        let mut buffer = vec![0u8; self.record_size];
        self.file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Digital samples of `count` records starting at `first`, one vector per signal
    pub fn read_records_digital(
        &mut self,
        first: u64,
        count: u64,
    ) -> Result<Vec<Vec<i16>>, EdfReaderError> {
        let mut per_signal: Vec<Vec<i16>> = self
            .header
            .signals
            .iter()
            .map(|s| Vec::with_capacity(s.samples_per_record * count as usize))
            .collect();
        for index in first..first + count {
            let raw = self.read_record_raw(index)?;
            let mut cursor = raw.as_slice();
            for (signal, samples) in per_signal.iter_mut().enumerate() {
                let spr = self.header.signals[signal].samples_per_record;
                let start = samples.len();
                samples.resize(start + spr, 0);
                cursor.read_i16_into::<LittleEndian>(&mut samples[start..])?;
            }
        }
        Ok(per_signal)
    }

    /// Up to `count` digital samples of one signal starting at `start_sample`. Fewer are
    /// returned when the file ends first.
    pub fn read_digital(
        &mut self,
        signal: usize,
        start_sample: u64,
        count: usize,
    ) -> Result<Vec<i16>, EdfReaderError> {
        let spr = self
            .header
            .signals
            .get(signal)
            .ok_or(EdfReaderError::BadSignal(signal))?
            .samples_per_record as u64;
        let mut samples = Vec::with_capacity(count);
        if spr == 0 {
            return Ok(samples);
        }
        let mut record = start_sample / spr;
        let mut skip = (start_sample % spr) as usize;
        let mut block = vec![0i16; spr as usize];
        while samples.len() < count && record < self.num_records() {
            self.seek_record(record, self.offsets[signal])?;
            self.file.read_i16_into::<LittleEndian>(&mut block)?;
            let take = (count - samples.len()).min(block.len() - skip);
            samples.extend_from_slice(&block[skip..skip + take]);
            skip = 0;
            record += 1;
        }
        Ok(samples)
    }

    pub fn read_physical(
        &mut self,
        signal: usize,
        start_sample: u64,
        count: usize,
    ) -> Result<Vec<f64>, EdfReaderError> {
        let digital = self.read_digital(signal, start_sample, count)?;
        let params = &self.header.signals[signal];
        Ok(digital.into_iter().map(|d| params.to_physical(d)).collect())
    }

    /// Raw bytes of one annotation signal in one record
    pub fn read_annotation_block(
        &mut self,
        record: u64,
        signal: usize,
    ) -> Result<Vec<u8>, EdfReaderError> {
        self.seek_record(record, self.offsets[signal])?;
        let mut bytes =
            vec![0u8; self.header.signals[signal].samples_per_record * BYTES_PER_SAMPLE];
        self.file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    /// Every annotation of every annotation signal, sorted by onset. Time-keeping TALs
    /// are not included.
    pub fn read_annotations(&mut self) -> Result<Vec<Annotation>, EdfReaderError> {
        let signals = self.header.annotation_signals();
        let mut annotations = Vec::new();
        for record in 0..self.num_records() {
            for signal in signals.iter() {
                let bytes = self.read_annotation_block(record, *signal)?;
                annotations.extend(parse_record_annotations(&bytes).1);
            }
        }
        annotations.sort_by(|a, b| a.onset.total_cmp(&b.onset));
        Ok(annotations)
    }

    /// Onset of each data record. Taken from the time-keeping TAL when present,
    /// otherwise `index * record_duration`.
    pub fn record_onsets(&mut self) -> Result<Vec<f64>, EdfReaderError> {
        let signal = self.header.annotation_signals().first().copied();
        let duration = self.header.record_duration;
        let mut onsets = Vec::with_capacity(self.num_records() as usize);
        for record in 0..self.num_records() {
            let nominal = record as f64 * duration;
            let onset = match signal {
                Some(signal) => {
                    let bytes = self.read_annotation_block(record, signal)?;
                    parse_record_annotations(&bytes).0.unwrap_or(nominal)
                }
                None => nominal,
            };
            onsets.push(onset);
        }
        Ok(onsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edf_header::tests::eeg_signal;
    use crate::edf_writer::{EdfWriter, WriterSetup};
    use time::macros::datetime;

    fn write_ramp(path: &Path, records: usize) {
        let setup = WriterSetup::new(
            "X X X X",
            "Startdate X X X X",
            datetime!(2023-05-01 08:00:00),
            1.0,
            vec![eeg_signal("EEG C3", 4), eeg_signal("EEG C4", 2)],
        );
        let mut writer = EdfWriter::create(path, setup).unwrap();
        for r in 0..records as i16 {
            let a: Vec<i16> = (0..4).map(|i| r * 10 + i).collect();
            let b: Vec<i16> = vec![-r, -r];
            writer.write_record(&[&a, &b]).unwrap();
        }
        writer.add_annotation(Annotation::new(1.5, None, "Marker"));
        writer.finish().unwrap();
    }

    #[test]
    fn test_read_digital_across_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.edf");
        write_ramp(&path, 3);

        let mut reader = EdfReader::open(&path).unwrap();
        assert_eq!(reader.num_records(), 3);
        assert_eq!(reader.header().signals.len(), 3);
        assert_eq!(reader.read_digital(0, 2, 4).unwrap(), vec![2, 3, 10, 11]);
        assert_eq!(reader.read_digital(1, 3, 10).unwrap(), vec![-1, -2, -2]);
        let chunk = reader.read_records_digital(1, 2).unwrap();
        assert_eq!(chunk[0], vec![10, 11, 12, 13, 20, 21, 22, 23]);
        assert!(matches!(
            reader.read_record_raw(3),
            Err(EdfReaderError::BadRecord(3))
        ));
    }

    #[test]
    fn test_annotations_and_onsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.edf");
        write_ramp(&path, 3);

        let mut reader = EdfReader::open(&path).unwrap();
        assert_eq!(
            reader.read_annotations().unwrap(),
            vec![Annotation::new(1.5, None, "Marker")]
        );
        assert_eq!(reader.record_onsets().unwrap(), vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn test_reconciles_record_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.edf");
        write_ramp(&path, 2);
        // simulate an interrupted writer
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[236..244].copy_from_slice(b"-1      ");
        std::fs::write(&path, &bytes).unwrap();

        let reader = EdfReader::open(&path).unwrap();
        assert_eq!(reader.num_records(), 2);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EdfReader::open(Path::new("/definitely/not/here.edf")),
            Err(EdfReaderError::BadFilePath(_))
        ));
    }
}
