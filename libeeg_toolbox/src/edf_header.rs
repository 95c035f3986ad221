//! Codec for the fixed-size EDF/EDF+ header.
//!
//! An EDF file starts with a 256 byte main header followed by 256 bytes per signal. All
//! fields are space padded ASCII. The signal block is laid out field-major: all labels,
//! then all transducers, and so on.
use std::io::Read;
use time::{Date, Duration, Month, PrimitiveDateTime, Time};

use super::constants::*;
use super::error::EdfHeaderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Edf,
    EdfPlusContinuous,
    EdfPlusDiscontinuous,
}

impl FileType {
    pub fn is_plus(&self) -> bool {
        !matches!(self, FileType::Edf)
    }
}

/// Parameters of a single signal as stored in the signal header block.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalHeader {
    pub label: String,
    pub transducer: String,
    pub physical_dimension: String,
    pub physical_min: f64,
    pub physical_max: f64,
    pub digital_min: i32,
    pub digital_max: i32,
    pub prefilter: String,
    pub samples_per_record: usize,
    pub reserved: String,
}

impl SignalHeader {
    /// The header of an EDF+ annotation signal holding `bytes` per data record.
    pub fn annotation(bytes: usize) -> Self {
        Self {
            label: String::from(ANNOTATION_LABEL),
            transducer: String::new(),
            physical_dimension: String::new(),
            physical_min: -1.0,
            physical_max: 1.0,
            digital_min: i16::MIN as i32,
            digital_max: i16::MAX as i32,
            prefilter: String::new(),
            samples_per_record: bytes.div_ceil(BYTES_PER_SAMPLE),
            reserved: String::new(),
        }
    }

    pub fn is_annotation(&self) -> bool {
        self.label.trim() == ANNOTATION_LABEL
    }

    /// Physical units per digital step
    pub fn gain(&self) -> f64 {
        let digital_span = (self.digital_max - self.digital_min) as f64;
        if digital_span == 0.0 {
            return 0.0;
        }
        (self.physical_max - self.physical_min) / digital_span
    }

    pub fn to_physical(&self, digital: i16) -> f64 {
        self.physical_min + (digital as f64 - self.digital_min as f64) * self.gain()
    }

    /// The digital value whose physical value is closest to zero.
    pub fn digital_zero(&self) -> i16 {
        let gain = self.gain();
        let raw = if gain == 0.0 {
            0.0
        } else {
            self.digital_min as f64 - self.physical_min / gain
        };
        let low = self.digital_min.max(i16::MIN as i32) as f64;
        let high = self.digital_max.min(i16::MAX as i32) as f64;
        raw.round().clamp(low.min(high), high.max(low)) as i16
    }

    pub fn sample_frequency(&self, record_duration: f64) -> f64 {
        if record_duration > 0.0 {
            self.samples_per_record as f64 / record_duration
        } else {
            0.0
        }
    }
}

/// EDF+ patient subfields: code, sex, birthdate, name, additional
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientInfo {
    pub code: String,
    pub sex: String,
    pub birthdate: String,
    pub name: String,
    pub additional: String,
}

/// EDF+ recording subfields following the literal `Startdate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingInfo {
    pub startdate: String,
    pub admin_code: String,
    pub technician: String,
    pub equipment: String,
    pub additional: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdfHeader {
    pub version: String,
    pub patient: String,
    pub recording: String,
    pub start: PrimitiveDateTime,
    pub header_bytes: usize,
    pub reserved: String,
    pub num_data_records: i64,
    pub record_duration: f64,
    pub signals: Vec<SignalHeader>,
}

impl EdfHeader {
    /// Build a header for a new file. The header size is derived from the signals.
    pub fn new(
        patient: &str,
        recording: &str,
        start: PrimitiveDateTime,
        reserved: &str,
        record_duration: f64,
        signals: Vec<SignalHeader>,
    ) -> Self {
        Self {
            version: String::from(EDF_VERSION),
            patient: patient.to_string(),
            recording: recording.to_string(),
            start,
            header_bytes: MAIN_HEADER_BYTES + SIGNAL_HEADER_BYTES * signals.len(),
            reserved: reserved.to_string(),
            num_data_records: -1,
            record_duration,
            signals,
        }
    }

    /// Parse the main header and the signal headers from the start of a stream
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, EdfHeaderError> {
        let mut main = [0u8; MAIN_HEADER_BYTES];
        read_exact_or_truncated(reader, &mut main, MAIN_HEADER_BYTES)?;
        if main[0] == 0xFF {
            return Err(EdfHeaderError::BdfNotSupported);
        }

        let version = ascii_field(&main[0..8]);
        if version != EDF_VERSION {
            return Err(EdfHeaderError::BadVersion(version));
        }
        let patient = ascii_field(&main[8..88]);
        let recording = ascii_field(&main[88..168]);
        let start = parse_start(&ascii_field(&main[168..176]), &ascii_field(&main[176..184]))?;
        let header_bytes: usize = parse_number("header bytes", &main[184..192])?;
        let reserved = ascii_field(&main[192..236]);
        let num_data_records: i64 = parse_number("number of data records", &main[236..244])?;
        let record_duration: f64 = parse_number("data record duration", &main[244..252])?;
        let ns: i64 = parse_number("number of signals", &main[252..256])?;
        if ns < 1 {
            return Err(EdfHeaderError::BadSignalCount(ns));
        }
        let ns = ns as usize;

        let mut block = vec![0u8; ns * SIGNAL_HEADER_BYTES];
        read_exact_or_truncated(
            reader,
            &mut block,
            MAIN_HEADER_BYTES + ns * SIGNAL_HEADER_BYTES,
        )?;
        let mut cursor = FieldCursor::new(&block, ns);
        let labels = cursor.next_fields(16);
        let transducers = cursor.next_fields(80);
        let dimensions = cursor.next_fields(8);
        let physical_mins = cursor.next_fields(8);
        let physical_maxs = cursor.next_fields(8);
        let digital_mins = cursor.next_fields(8);
        let digital_maxs = cursor.next_fields(8);
        let prefilters = cursor.next_fields(80);
        let samples = cursor.next_fields(8);
        let reserveds = cursor.next_fields(32);

        let mut signals = Vec::with_capacity(ns);
        for idx in 0..ns {
            signals.push(SignalHeader {
                label: labels[idx].clone(),
                transducer: transducers[idx].clone(),
                physical_dimension: dimensions[idx].clone(),
                physical_min: parse_str("physical minimum", &physical_mins[idx])?,
                physical_max: parse_str("physical maximum", &physical_maxs[idx])?,
                digital_min: parse_str("digital minimum", &digital_mins[idx])?,
                digital_max: parse_str("digital maximum", &digital_maxs[idx])?,
                prefilter: prefilters[idx].clone(),
                samples_per_record: parse_str("samples per record", &samples[idx])?,
                reserved: reserveds[idx].clone(),
            });
        }

        Ok(Self {
            version,
            patient,
            recording,
            start,
            header_bytes,
            reserved,
            num_data_records,
            record_duration,
            signals,
        })
    }

    /// Serialize the header. The header size field is always recomputed from the signals.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EdfHeaderError> {
        let ns = self.signals.len();
        let mut out = Vec::with_capacity(MAIN_HEADER_BYTES + ns * SIGNAL_HEADER_BYTES);
        push_text(&mut out, &self.version, 8);
        push_text(&mut out, &self.patient, 80);
        push_text(&mut out, &self.recording, 80);
        push_text(
            &mut out,
            &format!(
                "{:02}.{:02}.{:02}",
                self.start.day(),
                u8::from(self.start.month()),
                self.start.year().rem_euclid(100)
            ),
            8,
        );
        push_text(
            &mut out,
            &format!(
                "{:02}.{:02}.{:02}",
                self.start.hour(),
                self.start.minute(),
                self.start.second()
            ),
            8,
        );
        push_text(
            &mut out,
            &fit_number((MAIN_HEADER_BYTES + ns * SIGNAL_HEADER_BYTES) as f64, 8)?,
            8,
        );
        push_text(&mut out, &self.reserved, 44);
        push_text(&mut out, &fit_number(self.num_data_records as f64, 8)?, 8);
        push_text(&mut out, &fit_number(self.record_duration, 8)?, 8);
        push_text(&mut out, &fit_number(ns as f64, 4)?, 4);

        for s in &self.signals {
            push_text(&mut out, &s.label, 16);
        }
        for s in &self.signals {
            push_text(&mut out, &s.transducer, 80);
        }
        for s in &self.signals {
            push_text(&mut out, &s.physical_dimension, 8);
        }
        for s in &self.signals {
            push_text(&mut out, &fit_number(s.physical_min, 8)?, 8);
        }
        for s in &self.signals {
            push_text(&mut out, &fit_number(s.physical_max, 8)?, 8);
        }
        for s in &self.signals {
            push_text(&mut out, &fit_number(s.digital_min as f64, 8)?, 8);
        }
        for s in &self.signals {
            push_text(&mut out, &fit_number(s.digital_max as f64, 8)?, 8);
        }
        for s in &self.signals {
            push_text(&mut out, &s.prefilter, 80);
        }
        for s in &self.signals {
            push_text(&mut out, &fit_number(s.samples_per_record as f64, 8)?, 8);
        }
        for s in &self.signals {
            push_text(&mut out, &s.reserved, 32);
        }
        Ok(out)
    }

    pub fn file_type(&self) -> FileType {
        if self.reserved.starts_with(EDF_PLUS_CONTINUOUS) {
            FileType::EdfPlusContinuous
        } else if self.reserved.starts_with(EDF_PLUS_DISCONTINUOUS) {
            FileType::EdfPlusDiscontinuous
        } else {
            FileType::Edf
        }
    }

    pub fn record_size_bytes(&self) -> usize {
        self.signals
            .iter()
            .map(|s| s.samples_per_record * BYTES_PER_SAMPLE)
            .sum()
    }

    /// Byte offset of each signal inside a data record
    pub fn signal_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::with_capacity(self.signals.len());
        let mut offset = 0;
        for s in &self.signals {
            offsets.push(offset);
            offset += s.samples_per_record * BYTES_PER_SAMPLE;
        }
        offsets
    }

    pub fn annotation_signals(&self) -> Vec<usize> {
        (0..self.signals.len())
            .filter(|idx| self.signals[*idx].is_annotation())
            .collect()
    }

    pub fn ordinary_signals(&self) -> Vec<usize> {
        (0..self.signals.len())
            .filter(|idx| !self.signals[*idx].is_annotation())
            .collect()
    }

    pub fn duration_secs(&self) -> f64 {
        self.num_data_records.max(0) as f64 * self.record_duration
    }

    /// Start time shifted by `offset_secs`, split into a whole-second start and the
    /// remaining sub-second fraction (EDF+ carries the fraction in the first TAL).
    pub fn start_with_offset(&self, offset_secs: f64) -> (PrimitiveDateTime, f64) {
        let whole = offset_secs.floor();
        let start = self.start + Duration::seconds(whole as i64);
        (start, offset_secs - whole)
    }

    pub fn patient_info(&self) -> Option<PatientInfo> {
        if !self.file_type().is_plus() {
            return None;
        }
        let parts: Vec<&str> = self.patient.split_whitespace().collect();
        if parts.len() < 4 {
            return None;
        }
        Some(PatientInfo {
            code: parts[0].to_string(),
            sex: parts[1].to_string(),
            birthdate: parts[2].to_string(),
            name: parts[3].replace('_', " "),
            additional: parts[4..].join(" "),
        })
    }

    pub fn recording_info(&self) -> Option<RecordingInfo> {
        if !self.file_type().is_plus() {
            return None;
        }
        let parts: Vec<&str> = self.recording.split_whitespace().collect();
        if parts.len() < 5 || parts[0] != "Startdate" {
            return None;
        }
        Some(RecordingInfo {
            startdate: parts[1].to_string(),
            admin_code: parts[2].to_string(),
            technician: parts[3].to_string(),
            equipment: parts[4].to_string(),
            additional: parts[5..].join(" "),
        })
    }
}

/// Format a number to fit in `width` characters, dropping decimals as needed.
pub fn fit_number(value: f64, width: usize) -> Result<String, EdfHeaderError> {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        let s = format!("{}", value as i64);
        if s.len() <= width {
            return Ok(s);
        }
    }
    for precision in (1..width).rev() {
        let s = trim_decimal(format!("{:.*}", precision, value));
        if s.len() <= width {
            return Ok(s);
        }
    }
    Err(EdfHeaderError::FieldOverflow {
        value: value.to_string(),
        width,
    })
}

fn trim_decimal(s: String) -> String {
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.');
        if trimmed == "-0" {
            return String::from("0");
        }
        trimmed.to_string()
    } else {
        s
    }
}

fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    needed: usize,
) -> Result<(), EdfHeaderError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(EdfHeaderError::Truncated(needed))
        }
        Err(e) => Err(EdfHeaderError::IOError(e)),
    }
}

fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

fn parse_number<T: std::str::FromStr>(
    field: &'static str,
    bytes: &[u8],
) -> Result<T, EdfHeaderError> {
    parse_str(field, &ascii_field(bytes))
}

fn parse_str<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, EdfHeaderError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| EdfHeaderError::BadNumber {
            field,
            value: value.to_string(),
        })
}

/// Parse `dd.mm.yy` and `hh.mm.ss`, applying the 1985 clipping year.
pub fn parse_start(date: &str, clock: &str) -> Result<PrimitiveDateTime, EdfHeaderError> {
    let bad = || EdfHeaderError::BadDateTime(format!("{date} {clock}"));
    let d = split_triplet(date).ok_or_else(bad)?;
    let t = split_triplet(clock).ok_or_else(bad)?;
    let year = if d.2 >= 85 { 1900 + d.2 } else { 2000 + d.2 };
    let month = Month::try_from(d.1 as u8).map_err(|_| bad())?;
    let date = Date::from_calendar_date(year as i32, month, d.0 as u8).map_err(|_| bad())?;
    let clock = Time::from_hms(t.0 as u8, t.1 as u8, t.2 as u8).map_err(|_| bad())?;
    Ok(PrimitiveDateTime::new(date, clock))
}

fn split_triplet(value: &str) -> Option<(u32, u32, u32)> {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.len() != 2) {
        return None;
    }
    Some((
        parts[0].parse().ok()?,
        parts[1].parse().ok()?,
        parts[2].parse().ok()?,
    ))
}

/// Write `value` as printable ASCII, truncated or space padded to `width`
fn push_text(out: &mut Vec<u8>, value: &str, width: usize) {
    let mut written = 0;
    for ch in value.chars() {
        if written == width {
            break;
        }
        let byte = if ch.is_ascii() && !ch.is_ascii_control() {
            ch as u8
        } else {
            b'_'
        };
        out.push(byte);
        written += 1;
    }
    out.extend(std::iter::repeat(b' ').take(width - written));
}

struct FieldCursor<'a> {
    block: &'a [u8],
    n_signals: usize,
    position: usize,
}

impl<'a> FieldCursor<'a> {
    fn new(block: &'a [u8], n_signals: usize) -> Self {
        Self {
            block,
            n_signals,
            position: 0,
        }
    }

    fn next_fields(&mut self, width: usize) -> Vec<String> {
        let mut fields = Vec::with_capacity(self.n_signals);
        for _ in 0..self.n_signals {
            fields.push(ascii_field(
                &self.block[self.position..self.position + width],
            ));
            self.position += width;
        }
        fields
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use time::macros::datetime;

    pub(crate) fn eeg_signal(label: &str, samples_per_record: usize) -> SignalHeader {
        SignalHeader {
            label: label.to_string(),
            transducer: String::from("AgAgCl electrode"),
            physical_dimension: String::from("uV"),
            physical_min: -3276.8,
            physical_max: 3276.7,
            digital_min: -32768,
            digital_max: 32767,
            prefilter: String::from("HP:0.1Hz LP:75Hz"),
            samples_per_record,
            reserved: String::new(),
        }
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = EdfHeader::new(
            "MCH-0234567 F 02-MAY-1951 Haagse_Harry",
            "Startdate 02-MAR-2002 EMG561 BK/JOP Sony. MNC R Median Nerve.",
            datetime!(2002-03-02 14:30:05),
            "EDF+C",
            0.5,
            vec![eeg_signal("EEG Fp1", 128), SignalHeader::annotation(60)],
        );
        header.num_data_records = 42;
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), 256 * 3);

        let parsed = EdfHeader::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.file_type(), FileType::EdfPlusContinuous);
        assert_eq!(parsed.annotation_signals(), vec![1]);
        assert_eq!(parsed.ordinary_signals(), vec![0]);
        assert_eq!(parsed.record_size_bytes(), 128 * 2 + 60 * 2);
        assert_eq!(parsed.signal_offsets(), vec![0, 256]);
        assert_eq!(parsed.duration_secs(), 21.0);
    }

    #[test]
    fn test_patient_and_recording_subfields() {
        let header = EdfHeader::new(
            "MCH-0234567 F 02-MAY-1951 Haagse_Harry extra info",
            "Startdate 02-MAR-2002 EMG561 BK/JOP Sony. MNC",
            datetime!(2002-03-02 14:30:05),
            "EDF+C",
            1.0,
            vec![eeg_signal("EEG Fp1", 256)],
        );
        let patient = header.patient_info().unwrap();
        assert_eq!(patient.code, "MCH-0234567");
        assert_eq!(patient.name, "Haagse Harry");
        assert_eq!(patient.additional, "extra info");
        let recording = header.recording_info().unwrap();
        assert_eq!(recording.technician, "BK/JOP");
        assert_eq!(recording.equipment, "Sony.");
    }

    #[test]
    fn test_clipping_year() {
        assert_eq!(
            parse_start("01.02.85", "10.11.12").unwrap(),
            datetime!(1985-02-01 10:11:12)
        );
        assert_eq!(
            parse_start("01.02.84", "10.11.12").unwrap(),
            datetime!(2084-02-01 10:11:12)
        );
        assert!(parse_start("1.2.84", "10.11.12").is_err());
        assert!(parse_start("31.02.20", "10.11.12").is_err());
    }

    #[test]
    fn test_fit_number() {
        assert_eq!(fit_number(256.0, 8).unwrap(), "256");
        assert_eq!(fit_number(-3276.8, 8).unwrap(), "-3276.8");
        assert_eq!(fit_number(0.1234567891, 8).unwrap(), "0.123457");
        assert_eq!(fit_number(-0.0, 8).unwrap(), "0");
        assert!(fit_number(1.0e12, 8).is_err());
    }

    #[test]
    fn test_physical_conversion() {
        let signal = eeg_signal("EEG Fp1", 256);
        assert!((signal.to_physical(0) - 0.0).abs() < 0.05 + 1e-9);
        assert_eq!(signal.to_physical(-32768), -3276.8);
        assert_eq!(signal.digital_zero(), 0);
        assert_eq!(signal.sample_frequency(0.5), 512.0);
    }

    #[test]
    fn test_rejects_bdf() {
        let mut bytes = vec![b' '; 256];
        bytes[0] = 0xFF;
        assert!(matches!(
            EdfHeader::read_from(&mut bytes.as_slice()),
            Err(EdfHeaderError::BdfNotSupported)
        ));
    }
}
