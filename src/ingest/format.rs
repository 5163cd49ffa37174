//! File format, encoding, and delimiter detection (SPEC_FULL 4.1).

use std::path::Path;

/// Tabular source format, detected by extension then content probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Csv,
    Tsv,
    Xlsx,
    Xls,
    Json,
    JsonLines,
    Text,
}

impl FileFormat {
    /// Detect by extension, falling back to a content probe of `sample`.
    pub fn detect(path: &Path, sample: &[u8]) -> Self {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            match ext.to_lowercase().as_str() {
                "csv" => return Self::Csv,
                "tsv" => return Self::Tsv,
                "xlsx" => return Self::Xlsx,
                "xls" => return Self::Xls,
                "json" => return Self::Json,
                "jsonl" | "ndjson" => return Self::JsonLines,
                "txt" => return Self::probe_text(sample),
                _ => {}
            }
        }
        Self::probe_content(sample)
    }

    fn probe_content(sample: &[u8]) -> Self {
        if sample.starts_with(&[0x50, 0x4B, 0x03, 0x04]) {
            // ZIP magic bytes; xlsx is a zip container.
            return Self::Xlsx;
        }
        if sample.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
            // OLE2 compound file magic bytes; legacy xls.
            return Self::Xls;
        }
        Self::probe_text(sample)
    }

    fn probe_text(sample: &[u8]) -> Self {
        let trimmed = sample
            .iter()
            .copied()
            .find(|b| !b.is_ascii_whitespace());
        match trimmed {
            Some(b'{') | Some(b'[') => Self::Json,
            _ => {
                let delimiter = Delimiter::detect(sample);
                match delimiter {
                    Delimiter::Tab => Self::Tsv,
                    _ => Self::Csv,
                }
            }
        }
    }
}

/// A text-format field delimiter candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delimiter {
    Comma,
    Tab,
    Semicolon,
    Pipe,
}

impl Delimiter {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Comma => b',',
            Self::Tab => b'\t',
            Self::Semicolon => b';',
            Self::Pipe => b'|',
        }
    }

    const CANDIDATES: [Delimiter; 4] = [Self::Comma, Self::Tab, Self::Semicolon, Self::Pipe];

    /// Score each candidate by per-line field-count variance (lower is
    /// better) across the first 20 non-empty lines; tie-break by the
    /// candidate yielding more fields (SPEC_FULL 4.1).
    pub fn detect(sample: &[u8]) -> Self {
        let text = String::from_utf8_lossy(sample);
        let lines: Vec<&str> = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .take(20)
            .collect();
        if lines.is_empty() {
            return Self::Comma;
        }

        let mut best = Self::Comma;
        let mut best_variance = f64::MAX;
        let mut best_fields = 0usize;

        for candidate in Self::CANDIDATES {
            let byte = candidate.as_byte();
            let counts: Vec<usize> = lines
                .iter()
                .map(|line| line.as_bytes().iter().filter(|b| **b == byte).count())
                .collect();
            if counts.iter().all(|c| *c == 0) {
                continue;
            }
            let mean = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
            let variance = counts
                .iter()
                .map(|c| (*c as f64 - mean).powi(2))
                .sum::<f64>()
                / counts.len() as f64;
            let fields = counts.iter().max().copied().unwrap_or(0);

            if variance < best_variance || (variance == best_variance && fields > best_fields) {
                best = candidate;
                best_variance = variance;
                best_fields = fields;
            }
        }
        best
    }
}

/// Probe the first `probe_len` bytes of `data` for text encoding, trying
/// candidates in the order: detector best guess, `utf-8`, `utf-8-sig`
/// (BOM-stripped utf-8), `cp1252`, `latin-1`. Returns the decoded text and
/// whether the accepted encoding's confidence was below the 0.7 threshold.
pub fn detect_and_decode(data: &[u8]) -> (String, bool) {
    let probe_len = data.len().min(10 * 1024);
    let probe = &data[..probe_len];

    let mut detector = chardetng::EncodingDetector::new();
    detector.feed(probe, true);
    let (guessed, confident) = detector.guess(None, true).decode(data);
    if confident && !guessed.contains('\u{FFFD}') {
        return (guessed.into_owned(), true);
    }

    if let Some(stripped) = data.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        if let Ok(s) = std::str::from_utf8(stripped) {
            return (s.to_string(), true);
        }
    }
    if let Ok(s) = std::str::from_utf8(data) {
        return (s.to_string(), true);
    }

    for encoding in [encoding_rs::WINDOWS_1252, encoding_rs::WINDOWS_1252] {
        let (decoded, _, had_errors) = encoding.decode(data);
        if !had_errors {
            return (decoded.into_owned(), false);
        }
    }

    let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(data);
    (decoded.into_owned(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_csv_by_extension() {
        assert_eq!(
            FileFormat::detect(Path::new("recipients.csv"), b"a,b,c"),
            FileFormat::Csv
        );
    }

    #[test]
    fn detects_json_by_leading_bracket() {
        assert_eq!(
            FileFormat::detect(Path::new("recipients.txt"), b"[{\"a\":1}]"),
            FileFormat::Json
        );
    }

    #[test]
    fn delimiter_detection_prefers_consistent_commas() {
        let sample = b"a,b,c\n1,2,3\n4,5,6\n";
        assert_eq!(Delimiter::detect(sample), Delimiter::Comma);
    }

    #[test]
    fn delimiter_detection_picks_semicolon_when_consistent() {
        let sample = b"a;b;c\n1;2;3\n4;5;6\n";
        assert_eq!(Delimiter::detect(sample), Delimiter::Semicolon);
    }

    #[test]
    fn decodes_plain_utf8() {
        let (text, confident) = detect_and_decode("héllo".as_bytes());
        assert_eq!(text, "héllo");
        assert!(confident);
    }

    #[test]
    fn strips_utf8_bom() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"name,email");
        let (text, _) = detect_and_decode(&bytes);
        assert_eq!(text, "name,email");
    }
}
