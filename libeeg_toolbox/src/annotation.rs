use super::constants::{TAL_DURATION_MARK, TAL_SEPARATOR, TAL_TERMINATOR};

/// A single EDF+ annotation. Onset is in seconds relative to the file start.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub onset: f64,
    pub duration: Option<f64>,
    pub description: String,
}

impl Annotation {
    pub fn new(onset: f64, duration: Option<f64>, description: &str) -> Self {
        Self {
            onset,
            duration,
            description: description.to_string(),
        }
    }

    /// Copy of this annotation with the onset moved by `offset` seconds
    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            onset: self.onset + offset,
            duration: self.duration,
            description: self.description.clone(),
        }
    }
}

/// A time-stamped annotation list: one onset, optional duration, one or more texts
#[derive(Debug, Clone, PartialEq)]
pub struct Tal {
    pub onset: f64,
    pub duration: Option<f64>,
    pub texts: Vec<String>,
}

impl Tal {
    /// Time-keeping TALs carry an empty first text
    pub fn is_timekeeping(&self) -> bool {
        self.texts.first().map_or(true, |t| t.is_empty())
    }
}

/// Parse every TAL in an annotation signal block. Malformed TALs are skipped.
pub fn parse_tals(bytes: &[u8]) -> Vec<Tal> {
    let mut tals = Vec::new();
    for raw in bytes.split(|b| *b == TAL_TERMINATOR) {
        if raw.is_empty() {
            continue;
        }
        let mut parts: Vec<&[u8]> = raw.split(|b| *b == TAL_SEPARATOR).collect();
        // a TAL ends with a separator, leaving an empty trailing piece
        if parts.len() > 1 && parts.last().is_some_and(|p| p.is_empty()) {
            parts.pop();
        }
        let mut stamp = parts[0].splitn(2, |b| *b == TAL_DURATION_MARK);
        let onset = match stamp.next().and_then(parse_seconds) {
            Some(onset) => onset,
            None => {
                log::debug!("Skipping TAL with invalid onset {:?}", String::from_utf8_lossy(raw));
                continue;
            }
        };
        let duration = stamp.next().and_then(parse_seconds);
        let texts = parts[1..]
            .iter()
            .map(|t| String::from_utf8_lossy(t).to_string())
            .collect();
        tals.push(Tal {
            onset,
            duration,
            texts,
        });
    }
    tals
}

/// Split one data record's annotation bytes into its time-keeping onset and the
/// annotations it carries.
pub fn parse_record_annotations(bytes: &[u8]) -> (Option<f64>, Vec<Annotation>) {
    let mut timekeeping = None;
    let mut annotations = Vec::new();
    for (idx, tal) in parse_tals(bytes).into_iter().enumerate() {
        let mut texts = tal.texts.iter();
        if idx == 0 && tal.is_timekeeping() {
            timekeeping = Some(tal.onset);
            texts.next();
        }
        for text in texts.filter(|t| !t.is_empty()) {
            annotations.push(Annotation::new(tal.onset, tal.duration, text));
        }
    }
    (timekeeping, annotations)
}

pub fn encode_tal(onset: f64, duration: Option<f64>, texts: &[&str]) -> Vec<u8> {
    let mut out = format_onset(onset).into_bytes();
    if let Some(duration) = duration {
        out.push(TAL_DURATION_MARK);
        out.extend(format_seconds(duration).into_bytes());
    }
    out.push(TAL_SEPARATOR);
    for text in texts {
        out.extend(text.as_bytes());
        out.push(TAL_SEPARATOR);
    }
    out.push(TAL_TERMINATOR);
    out
}

pub fn encode_timekeeping(onset: f64) -> Vec<u8> {
    encode_tal(onset, None, &[""])
}

/// Signed onset, e.g. `+12.5` or `-0.25`
pub fn format_onset(onset: f64) -> String {
    if onset < 0.0 {
        format!("-{}", format_seconds(-onset))
    } else {
        format!("+{}", format_seconds(onset))
    }
}

fn format_seconds(value: f64) -> String {
    let s = format!("{value:.7}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() || s == "-0" {
        String::from("0")
    } else {
        s.to_string()
    }
}

fn parse_seconds(bytes: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(bytes).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_record() {
        let mut block = encode_timekeeping(3.5);
        block.extend(encode_tal(4.0, Some(1.25), &["Eyes closed"]));
        block.extend(encode_tal(4.5, None, &["Photic", "Spike"]));
        block.extend(vec![0u8; 12]);

        let (timekeeping, annotations) = parse_record_annotations(&block);
        assert_eq!(timekeeping, Some(3.5));
        assert_eq!(
            annotations,
            vec![
                Annotation::new(4.0, Some(1.25), "Eyes closed"),
                Annotation::new(4.5, None, "Photic"),
                Annotation::new(4.5, None, "Spike"),
            ]
        );
    }

    #[test]
    fn test_first_tal_with_text_is_not_timekeeping() {
        let block = encode_tal(1.0, None, &["Seizure"]);
        let (timekeeping, annotations) = parse_record_annotations(&block);
        assert_eq!(timekeeping, None);
        assert_eq!(annotations.len(), 1);
    }

    #[test]
    fn test_encode_format() {
        assert_eq!(encode_timekeeping(0.0), b"+0\x14\x14\x00".to_vec());
        assert_eq!(
            encode_tal(-0.5, Some(2.0), &["x"]),
            b"-0.5\x152\x14x\x14\x00".to_vec()
        );
        assert_eq!(format_onset(1.0 / 3.0), "+0.3333333");
    }

    #[test]
    fn test_skips_garbage() {
        let tals = parse_tals(b"abc\x14text\x14\x00+2\x14ok\x14\x00");
        assert_eq!(tals.len(), 1);
        assert_eq!(tals[0].onset, 2.0);
        assert_eq!(tals[0].texts, vec![String::from("ok")]);
    }
}
