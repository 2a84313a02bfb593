//! Sample types and the line protocol spoken by the sensor board.
//!
//! The board prints one reading per line: a single integer in single-channel
//! mode, or two comma-separated integers in dual-channel mode. Anything else
//! is dropped.

use serde::{Deserialize, Serialize};

/// How many readings each serial line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    #[default]
    Single,
    Dual,
}

impl ChannelMode {
    /// Number of channels per sample.
    pub fn count(self) -> usize {
        match self {
            ChannelMode::Single => 1,
            ChannelMode::Dual => 2,
        }
    }
}

/// One acquisition step. Arrival order is the only timing information kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sample {
    Single(i32),
    Dual(i32, i32),
}

impl Sample {
    /// Reading for a channel index; `None` when the sample has no such channel.
    pub fn channel(&self, index: usize) -> Option<i32> {
        match (self, index) {
            (Sample::Single(v), 0) => Some(*v),
            (Sample::Dual(a, _), 0) => Some(*a),
            (Sample::Dual(_, b), 1) => Some(*b),
            _ => None,
        }
    }

    pub fn mode(&self) -> ChannelMode {
        match self {
            Sample::Single(_) => ChannelMode::Single,
            Sample::Dual(..) => ChannelMode::Dual,
        }
    }
}

/// Parse one serial line into a sample.
///
/// Returns `None` for empty lines, non-integer payloads and lines whose field
/// count does not match `mode`.
pub fn parse_line(line: &str, mode: ChannelMode) -> Option<Sample> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut fields = line.split(',').map(str::trim);
    match mode {
        ChannelMode::Single => {
            let value = fields.next()?.parse().ok()?;
            if fields.next().is_some() {
                return None;
            }
            Some(Sample::Single(value))
        }
        ChannelMode::Dual => {
            let first = fields.next()?.parse().ok()?;
            let second = fields.next()?.parse().ok()?;
            if fields.next().is_some() {
                return None;
            }
            Some(Sample::Dual(first, second))
        }
    }
}

/// Decode raw bytes from the port, discarding invalid UTF-8.
pub fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|c| *c != char::REPLACEMENT_CHARACTER)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_channel_parsing() {
        assert_eq!(parse_line("512", ChannelMode::Single), Some(Sample::Single(512)));
        assert_eq!(parse_line(" 87\r", ChannelMode::Single), Some(Sample::Single(87)));
        assert_eq!(parse_line("-3", ChannelMode::Single), Some(Sample::Single(-3)));
    }

    #[test]
    fn test_malformed_lines_are_dropped() {
        for line in ["abc", "1,2,3", "", "   ", "12.5", "1,"] {
            assert_eq!(parse_line(line, ChannelMode::Single), None, "line {line:?}");
            assert_eq!(parse_line(line, ChannelMode::Dual), None, "line {line:?}");
        }
    }

    #[test]
    fn test_dual_channel_parsing() {
        assert_eq!(
            parse_line("512,600", ChannelMode::Dual),
            Some(Sample::Dual(512, 600))
        );
        assert_eq!(parse_line("512", ChannelMode::Dual), None);
        assert_eq!(parse_line("512,x", ChannelMode::Dual), None);
        assert_eq!(parse_line("512,600", ChannelMode::Single), None);
    }

    #[test]
    fn test_sample_channel_access() {
        let sample = Sample::Dual(4, 9);
        assert_eq!(sample.channel(0), Some(4));
        assert_eq!(sample.channel(1), Some(9));
        assert_eq!(sample.channel(2), None);
        assert_eq!(Sample::Single(1).channel(1), None);
        assert_eq!(sample.mode().count(), 2);
    }

    #[test]
    fn test_decode_drops_invalid_utf8() {
        assert_eq!(decode_line(b"51\xff2\r\n"), "512");
        assert_eq!(decode_line(b"  300 \n"), "300");
    }
}
