//! Reading samples back out of a rendered document.
//!
//! Only the subset this crate writes is understood: one 8-bit vector
//! variable named [`SIGNAL_ID`], one value per timestamp.

use crate::document::{ValueChange, SIGNAL_ID};
use thiserror::Error;

const END_OF_DEFINITIONS: &str = "$enddefinitions $end";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no `$enddefinitions $end` line found")]
    MissingDefinitions,

    #[error("line {line}: bad timestamp `{token}`")]
    BadTimestamp { line: usize, token: String },

    #[error("line {line}: timestamp {time} does not advance past {previous}")]
    NonIncreasingTime { line: usize, time: u64, previous: u64 },

    #[error("line {line}: bad 8-bit value `{token}`")]
    BadValue { line: usize, token: String },

    #[error("line {line}: unknown signal `{id}`")]
    UnknownSignal { line: usize, id: String },

    #[error("line {line}: value change without a timestamp")]
    MissingTimestamp { line: usize },

    #[error("line {line}: unexpected `{token}`")]
    Unexpected { line: usize, token: String },
}

/// Parse the data block into value changes, in file order.
///
/// Line numbers in errors are 1-based over the whole document.
pub fn parse_changes(text: &str) -> Result<Vec<ValueChange>, ParseError> {
    let mut lines = text.lines().enumerate();
    lines
        .by_ref()
        .find(|(_, l)| l.trim() == END_OF_DEFINITIONS)
        .ok_or(ParseError::MissingDefinitions)?;

    let mut changes = Vec::new();
    let mut pending: Option<u64> = None;
    let mut previous: Option<u64> = None;

    for (index, raw) in lines {
        let line = index + 1;
        let entry = raw.trim();
        match entry {
            "" | "$dumpvars" | "$end" => {}
            _ if entry.starts_with('#') => {
                let time: u64 = entry[1..].parse().map_err(|_| ParseError::BadTimestamp {
                    line,
                    token: entry.to_string(),
                })?;
                if let Some(previous) = previous {
                    if time <= previous {
                        return Err(ParseError::NonIncreasingTime { line, time, previous });
                    }
                }
                previous = Some(time);
                pending = Some(time);
            }
            _ if entry.starts_with('b') => {
                let (bits, id) = entry[1..].split_once(' ').ok_or_else(|| ParseError::BadValue {
                    line,
                    token: entry.to_string(),
                })?;
                if id.trim() != SIGNAL_ID {
                    return Err(ParseError::UnknownSignal {
                        line,
                        id: id.trim().to_string(),
                    });
                }
                let binary = bits.bytes().all(|b| b == b'0' || b == b'1');
                if !binary || bits.is_empty() || bits.len() > 8 {
                    return Err(ParseError::BadValue {
                        line,
                        token: bits.to_string(),
                    });
                }
                let value = u8::from_str_radix(bits, 2).map_err(|_| ParseError::BadValue {
                    line,
                    token: bits.to_string(),
                })?;
                let time = pending.take().ok_or(ParseError::MissingTimestamp { line })?;
                changes.push(ValueChange { time, value });
            }
            _ => {
                return Err(ParseError::Unexpected {
                    line,
                    token: entry.to_string(),
                })
            }
        }
    }
    Ok(changes)
}

/// Recover the sample bytes from a rendered document.
pub fn parse_samples(text: &str) -> Result<Vec<u8>, ParseError> {
    Ok(parse_changes(text)?.into_iter().map(|c| c.value).collect())
}
