//! Byte-pattern parsing and scanning.
//!
//! Patterns are whitespace-separated tokens: `?`/`??` match any byte, a
//! two-character hex token may carry `?` per nibble (`4?`, `?C`), and any
//! other token is a fixed hex byte. Each element is a `(mask, value)` pair;
//! a byte matches when `(byte & mask) == value`.

use crate::dump::DumpReader;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A matched byte window: `[offset, offset + size)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRange {
    pub offset: u64,
    pub size: u64,
}

impl MatchRange {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Result of a subsequence scan: the coverage from the first match's start
/// to the last match's end, plus every per-step match range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubsequenceMatch {
    pub coverage: MatchRange,
    pub matches: Vec<MatchRange>,
}

/// One pattern element: `(byte & mask) == value` selects a match.
/// `(0, 0)` is a full-byte wildcard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatternElement {
    pub mask: u8,
    pub value: u8,
}

fn parse_nibble(c: char, shift: u8) -> Option<(u8, u8)> {
    if c == '?' {
        return Some((0, 0));
    }

    let value = c.to_digit(16)? as u8;
    Some((0xF << shift, value << shift))
}

/// Parse a textual pattern into its element list.
///
/// A malformed token makes the whole pattern unmatchable: the failure is
/// logged and `Err` returned so callers treat it as a miss.
pub fn parse_pattern(text: &str) -> Result<Vec<PatternElement>> {
    let mut pattern = Vec::new();

    for token in text.split_whitespace() {
        if token == "?" || token == "??" {
            pattern.push(PatternElement { mask: 0, value: 0 });
            continue;
        }

        let mut chars = token.chars();

        let element = match (chars.next(), chars.next(), chars.next()) {
            (Some(high), Some(low), None) => {
                let (mask_high, value_high) = parse_nibble(high, 4).ok_or_else(|| {
                    Error::Config(format!("malformed pattern token '{}'", token))
                })?;
                let (mask_low, value_low) = parse_nibble(low, 0).ok_or_else(|| {
                    Error::Config(format!("malformed pattern token '{}'", token))
                })?;

                PatternElement {
                    mask: mask_high | mask_low,
                    value: value_high | value_low,
                }
            }
            _ => {
                let value = u8::from_str_radix(token, 16).map_err(|_| {
                    Error::Config(format!("malformed pattern token '{}'", token))
                })?;

                PatternElement { mask: 0xFF, value }
            }
        };

        pattern.push(element);
    }

    Ok(pattern)
}

/// Render a pattern back to its canonical text form. Full wildcards print
/// as `??`, nibble wildcards as `?` in their position.
pub fn format_pattern(pattern: &[PatternElement]) -> String {
    pattern
        .iter()
        .map(|e| {
            let nibble = |shift: u8| -> String {
                if e.mask >> shift & 0xF == 0 {
                    "?".to_string()
                } else {
                    format!("{:X}", e.value >> shift & 0xF)
                }
            };

            format!("{}{}", nibble(4), nibble(0))
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Linear scan of a buffer for the first position where every element
/// matches by masked equality.
pub fn find_in_buffer(buffer: &[u8], pattern: &[PatternElement]) -> Option<usize> {
    if buffer.len() < pattern.len() || pattern.is_empty() {
        return None;
    }

    for index in 0..=buffer.len() - pattern.len() {
        let matched = pattern
            .iter()
            .enumerate()
            .all(|(i, e)| buffer[index + i] & e.mask == e.value);

        if matched {
            return Some(index);
        }
    }

    None
}

/// Search for a textual pattern inside `[start, start + size)`.
///
/// The read window is widened to the pattern length when the pattern is
/// longer than the declared size (legacy behavior kept for configuration
/// compatibility).
pub fn find_pattern_in_range(
    reader: &DumpReader,
    start: u64,
    size: u64,
    text: &str,
) -> Option<MatchRange> {
    let pattern = match parse_pattern(text) {
        Ok(p) => p,
        Err(e) => {
            warn!("unmatchable pattern '{}': {}", text, e);
            return None;
        }
    };

    let window = (pattern.len() as u64).max(size);
    let buffer = reader.read(start, window as usize);

    if buffer.is_empty() {
        return None;
    }

    find_in_buffer(&buffer, &pattern)
        .map(|index| MatchRange::new(start + index as u64, pattern.len() as u64))
}

/// Match an ordered list of patterns, each search starting one byte past the
/// previous match's end. Every pattern must match for a result; the coverage
/// spans from the first match's start to the last match's end.
pub fn find_pattern_subsequence(
    reader: &DumpReader,
    start: u64,
    size: u64,
    texts: &[String],
) -> Option<SubsequenceMatch> {
    if texts.is_empty() {
        return None;
    }

    let mut matches = Vec::with_capacity(texts.len());
    let mut next_offset = start;

    for text in texts {
        let found = find_pattern_in_range(reader, next_offset, size, text)?;
        next_offset = found.end();
        matches.push(found);
    }

    let first = matches.first()?;
    let last = matches.last()?;
    let coverage = MatchRange::new(first.offset, last.end() - first.offset);

    Some(SubsequenceMatch { coverage, matches })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fixed_and_wildcard_tokens() {
        let pattern = parse_pattern("48 8B ?? ? C3").unwrap();
        assert_eq!(pattern.len(), 5);
        assert_eq!(pattern[0], PatternElement { mask: 0xFF, value: 0x48 });
        assert_eq!(pattern[2], PatternElement { mask: 0, value: 0 });
        assert_eq!(pattern[3], PatternElement { mask: 0, value: 0 });
        assert_eq!(pattern[4], PatternElement { mask: 0xFF, value: 0xC3 });
    }

    #[test]
    fn test_parse_nibble_wildcards() {
        let pattern = parse_pattern("4? ?B").unwrap();
        assert_eq!(pattern[0], PatternElement { mask: 0xF0, value: 0x40 });
        assert_eq!(pattern[1], PatternElement { mask: 0x0F, value: 0x0B });
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_pattern("XZ").is_err());
        assert!(parse_pattern("48 8B NOPE").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for text in ["48 8B C3", "4? ?B ?? FF", "?? ??"] {
            let pattern = parse_pattern(text).unwrap();
            assert_eq!(format_pattern(&pattern), text);
            assert_eq!(parse_pattern(&format_pattern(&pattern)).unwrap(), pattern);
        }

        // `?` and `??` normalize to the same element.
        let pattern = parse_pattern("? ??").unwrap();
        assert_eq!(format_pattern(&pattern), "?? ??");
    }

    #[test]
    fn test_find_in_buffer_first_match_wins() {
        let buffer = [0x00, 0x48, 0x8B, 0x05, 0x48, 0x8B, 0x0D];
        let pattern = parse_pattern("48 8B ??").unwrap();
        assert_eq!(find_in_buffer(&buffer, &pattern), Some(1));
    }

    #[test]
    fn test_find_in_buffer_masked_equality() {
        let buffer = [0x12, 0x4C, 0x34];
        let pattern = parse_pattern("4?").unwrap();
        let index = find_in_buffer(&buffer, &pattern).unwrap();
        assert_eq!(index, 1);
        assert_eq!(buffer[index] & pattern[0].mask, pattern[0].value);
    }

    #[test]
    fn test_find_in_buffer_too_small() {
        let buffer = [0x48];
        let pattern = parse_pattern("48 8B").unwrap();
        assert_eq!(find_in_buffer(&buffer, &pattern), None);
    }
}
