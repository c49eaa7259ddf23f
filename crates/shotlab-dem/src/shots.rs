//! Text formats for detection events (input) and predicted observables
//! (output) used by `predict`.

use std::fmt::Write as _;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    #[error("unknown shot format '{0}' (expected one of: 01, dets, hits)")]
    UnknownFormat(String),
    #[error("format '{0}' cannot be used for detection event input")]
    NotReadable(String),
    #[error("line {line}: {message}")]
    BadShot { line: usize, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotFormat {
    /// One `0`/`1` character per bit, one line per shot.
    ZeroOne,
    /// `shot D0 D4 L1` per line.
    Dets,
    /// Comma-separated indices of set bits, one line per shot.
    Hits,
}

impl ShotFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShotFormat::ZeroOne => "01",
            ShotFormat::Dets => "dets",
            ShotFormat::Hits => "hits",
        }
    }
}

impl FromStr for ShotFormat {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "01" => Ok(ShotFormat::ZeroOne),
            "dets" => Ok(ShotFormat::Dets),
            "hits" => Ok(ShotFormat::Hits),
            other => Err(FormatError::UnknownFormat(other.to_string())),
        }
    }
}

/// Reads detection events, one `Vec` of sorted fired detectors per shot.
pub fn read_detection_events(
    text: &str,
    format: ShotFormat,
    num_detectors: u32,
) -> Result<Vec<Vec<u32>>, FormatError> {
    match format {
        ShotFormat::Dets => read_dets(text, num_detectors),
        ShotFormat::ZeroOne => read_01(text, num_detectors),
        ShotFormat::Hits => Err(FormatError::NotReadable(format.as_str().to_string())),
    }
}

fn read_dets(text: &str, num_detectors: u32) -> Result<Vec<Vec<u32>>, FormatError> {
    let mut shots = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let mut tokens = raw.split_whitespace();
        match tokens.next() {
            None => continue,
            Some("shot") => {}
            Some(other) => {
                return Err(FormatError::BadShot {
                    line,
                    message: format!("expected 'shot', found '{}'", other),
                })
            }
        }
        let mut fired = Vec::new();
        for tok in tokens {
            if let Some(d) = tok.strip_prefix('D') {
                let d = d.parse::<u32>().map_err(|_| FormatError::BadShot {
                    line,
                    message: format!("bad detector target '{}'", tok),
                })?;
                check_range(line, d, num_detectors)?;
                fired.push(d);
            } else if tok.strip_prefix('L').map_or(false, |l| l.parse::<u32>().is_ok()) {
                // Recorded observable flips are not decoder input.
            } else {
                return Err(FormatError::BadShot {
                    line,
                    message: format!("bad target '{}'", tok),
                });
            }
        }
        fired.sort_unstable();
        fired.dedup();
        shots.push(fired);
    }
    Ok(shots)
}

fn read_01(text: &str, num_detectors: u32) -> Result<Vec<Vec<u32>>, FormatError> {
    let mut shots = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let bits = raw.trim_end();
        if bits.len() != num_detectors as usize {
            return Err(FormatError::BadShot {
                line,
                message: format!(
                    "expected {} bits, found {}",
                    num_detectors,
                    bits.len()
                ),
            });
        }
        let mut fired = Vec::new();
        for (k, c) in bits.chars().enumerate() {
            match c {
                '0' => {}
                '1' => fired.push(k as u32),
                other => {
                    return Err(FormatError::BadShot {
                        line,
                        message: format!("unexpected character '{}'", other),
                    })
                }
            }
        }
        shots.push(fired);
    }
    Ok(shots)
}

fn check_range(line: usize, detector: u32, num_detectors: u32) -> Result<(), FormatError> {
    if detector >= num_detectors {
        return Err(FormatError::BadShot {
            line,
            message: format!(
                "detector D{} is outside the model's {} detectors",
                detector, num_detectors
            ),
        });
    }
    Ok(())
}

/// Writes one line per prediction, preserving order.
pub fn write_predictions(predictions: &[u64], format: ShotFormat, num_observables: u32) -> String {
    let mut out = String::new();
    for &obs in predictions {
        let set_bits = (0..num_observables).filter(|k| obs >> k & 1 == 1);
        match format {
            ShotFormat::ZeroOne => {
                for k in 0..num_observables {
                    out.push(if obs >> k & 1 == 1 { '1' } else { '0' });
                }
            }
            ShotFormat::Dets => {
                out.push_str("shot");
                for k in set_bits {
                    let _ = write!(out, " L{}", k);
                }
            }
            ShotFormat::Hits => {
                let hits: Vec<String> = set_bits.map(|k| k.to_string()).collect();
                out.push_str(&hits.join(","));
            }
        }
        out.push('\n');
    }
    out
}
