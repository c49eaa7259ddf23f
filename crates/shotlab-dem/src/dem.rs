//! Detector error model parser.
//!
//! # Supported Syntax
//!
//! ```text
//! error(probability) D<id> ... [^ D<id> ...] L<obs> ...
//! detector[(coords)] D<id>
//! logical_observable L<obs>
//! shift_detectors[(coords)] <n>
//! repeat N { ... }
//! ```
//!
//! `repeat` blocks are expanded, with `shift_detectors` offsets applied to
//! every later `D` target.

use std::collections::BTreeSet;
use std::str::FromStr;

use thiserror::Error;

/// Observable flips are packed into a `u64`.
pub const MAX_OBSERVABLES: u32 = 64;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DemError {
    #[error("line {line}: invalid syntax: {message}")]
    InvalidSyntax { line: usize, message: String },
    #[error("line {line}: invalid probability '{value}'")]
    InvalidProbability { line: usize, value: String },
    #[error("line {line}: observable L{index} exceeds the limit of 64 observables")]
    TooManyObservables { line: usize, index: u64 },
    #[error("line {line}: unbalanced block")]
    UnbalancedBlock { line: usize },
}

/// One independent error: with `probability`, flips every detector in
/// `detectors` and every observable bit in `observables`.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMechanism {
    pub probability: f64,
    /// Sorted, without duplicates.
    pub detectors: Vec<u32>,
    pub observables: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectorErrorModel {
    pub num_detectors: u32,
    pub num_observables: u32,
    pub mechanisms: Vec<ErrorMechanism>,
}

impl DetectorErrorModel {
    pub fn parse(text: &str) -> Result<Self, DemError> {
        let lines: Vec<(usize, &str)> = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.split('#').next().unwrap_or("").trim()))
            .filter(|(_, l)| !l.is_empty())
            .collect();
        let mut pos = 0;
        let block = parse_block(&lines, &mut pos, false)?;
        let mut builder = Builder::default();
        builder.run(&block)?;
        Ok(builder.dem)
    }
}

impl FromStr for DetectorErrorModel {
    type Err = DemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug)]
enum Target {
    Detector(u64),
    Observable(u64),
    Separator,
}

#[derive(Debug)]
enum Instruction {
    Error {
        line: usize,
        probability: f64,
        targets: Vec<Target>,
    },
    Detector {
        line: usize,
        targets: Vec<Target>,
    },
    Observable {
        line: usize,
        targets: Vec<Target>,
    },
    Shift(u64),
    Repeat {
        count: u64,
        body: Vec<Instruction>,
    },
}

fn syntax(line: usize, message: impl Into<String>) -> DemError {
    DemError::InvalidSyntax {
        line,
        message: message.into(),
    }
}

fn parse_block(
    lines: &[(usize, &str)],
    pos: &mut usize,
    nested: bool,
) -> Result<Vec<Instruction>, DemError> {
    let mut out = Vec::new();
    while *pos < lines.len() {
        let (line_no, text) = lines[*pos];
        *pos += 1;
        if text == "}" {
            if nested {
                return Ok(out);
            }
            return Err(DemError::UnbalancedBlock { line: line_no });
        }
        if let Some(rest) = text.strip_prefix("repeat") {
            let header = rest.trim();
            let count_text = header
                .strip_suffix('{')
                .ok_or_else(|| syntax(line_no, "repeat must end with '{'"))?
                .trim();
            let count = count_text
                .parse::<u64>()
                .map_err(|_| syntax(line_no, format!("bad repeat count '{}'", count_text)))?;
            let body = parse_block(lines, pos, true)?;
            out.push(Instruction::Repeat { count, body });
            continue;
        }
        out.push(parse_instruction(line_no, text)?);
    }
    if nested {
        let last = lines.last().map(|(n, _)| *n).unwrap_or(0);
        return Err(DemError::UnbalancedBlock { line: last });
    }
    Ok(out)
}

fn parse_instruction(line: usize, text: &str) -> Result<Instruction, DemError> {
    let name_end = text
        .find(|c: char| c == '(' || c.is_whitespace())
        .unwrap_or(text.len());
    let name = &text[..name_end];
    let mut rest = &text[name_end..];
    let mut args = "";
    if rest.starts_with('(') {
        let close = rest
            .find(')')
            .ok_or_else(|| syntax(line, "missing closing parenthesis"))?;
        args = &rest[1..close];
        rest = &rest[close + 1..];
    }
    if name == "shift_detectors" {
        let tok = rest.trim();
        let shift = tok
            .parse::<u64>()
            .map_err(|_| syntax(line, format!("bad detector shift '{}'", tok)))?;
        return Ok(Instruction::Shift(shift));
    }
    let targets = rest
        .split_whitespace()
        .map(|tok| parse_target(line, tok))
        .collect::<Result<Vec<_>, _>>()?;

    match name {
        "error" => {
            let probability = args
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|p| (0.0..=1.0).contains(p))
                .ok_or_else(|| DemError::InvalidProbability {
                    line,
                    value: args.trim().to_string(),
                })?;
            Ok(Instruction::Error {
                line,
                probability,
                targets,
            })
        }
        "detector" => Ok(Instruction::Detector { line, targets }),
        "logical_observable" => Ok(Instruction::Observable { line, targets }),
        other => Err(syntax(line, format!("unknown instruction '{}'", other))),
    }
}

fn parse_target(line: usize, tok: &str) -> Result<Target, DemError> {
    if tok == "^" {
        return Ok(Target::Separator);
    }
    let index = |digits: &str| {
        digits
            .parse::<u64>()
            .map_err(|_| syntax(line, format!("bad target '{}'", tok)))
    };
    if let Some(d) = tok.strip_prefix('D') {
        return Ok(Target::Detector(index(d)?));
    }
    if let Some(l) = tok.strip_prefix('L') {
        return Ok(Target::Observable(index(l)?));
    }
    Err(syntax(line, format!("bad target '{}'", tok)))
}

#[derive(Default)]
struct Builder {
    offset: u64,
    dem: DetectorErrorModel,
}

impl Builder {
    fn run(&mut self, block: &[Instruction]) -> Result<(), DemError> {
        for instruction in block {
            match instruction {
                Instruction::Error {
                    line,
                    probability,
                    targets,
                } => {
                    let mut detectors = BTreeSet::new();
                    let mut observables = 0u64;
                    for target in targets {
                        match target {
                            Target::Detector(d) => {
                                let d = self.detector(*line, *d)?;
                                if !detectors.remove(&d) {
                                    detectors.insert(d);
                                }
                            }
                            Target::Observable(l) => {
                                observables ^= 1u64 << self.observable(*line, *l)?;
                            }
                            Target::Separator => {}
                        }
                    }
                    self.dem.mechanisms.push(ErrorMechanism {
                        probability: *probability,
                        detectors: detectors.into_iter().collect(),
                        observables,
                    });
                }
                Instruction::Detector { line, targets } => {
                    for target in targets {
                        match target {
                            Target::Detector(d) => {
                                self.detector(*line, *d)?;
                            }
                            _ => return Err(syntax(*line, "detector takes only D targets")),
                        }
                    }
                }
                Instruction::Observable { line, targets } => {
                    for target in targets {
                        match target {
                            Target::Observable(l) => {
                                self.observable(*line, *l)?;
                            }
                            _ => {
                                return Err(syntax(
                                    *line,
                                    "logical_observable takes only L targets",
                                ))
                            }
                        }
                    }
                }
                Instruction::Shift(n) => self.offset += n,
                Instruction::Repeat { count, body } => {
                    for _ in 0..*count {
                        self.run(body)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn detector(&mut self, line: usize, relative: u64) -> Result<u32, DemError> {
        let absolute = u32::try_from(self.offset + relative)
            .map_err(|_| syntax(line, "detector index overflows u32"))?;
        self.dem.num_detectors = self.dem.num_detectors.max(absolute + 1);
        Ok(absolute)
    }

    fn observable(&mut self, line: usize, index: u64) -> Result<u32, DemError> {
        if index >= MAX_OBSERVABLES as u64 {
            return Err(DemError::TooManyObservables { line, index });
        }
        let index = index as u32;
        self.dem.num_observables = self.dem.num_observables.max(index + 1);
        Ok(index)
    }
}
