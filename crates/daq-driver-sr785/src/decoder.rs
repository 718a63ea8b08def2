//! Trace payload decoding
//!
//! Pure functions from reply bytes/text to [`Sample`]s. Nothing here touches the
//! transport.
//!
//! # Sentinels
//!
//! | Source              | Overflow          | Underflow         |
//! |---------------------|-------------------|-------------------|
//! | float32             | `+inf`            | `-inf`            |
//! | int16               | `i16::MAX`        | `i16::MIN`        |
//! | ASCII               | `overflow_tokens` | `underflow_tokens`|
//!
//! NaN is never a valid reading and fails with [`DaqError::Decode`].

use crate::dialect::{BlockHeader, Dialect};
use crate::template::{Endian, SampleFormat};
use daq_core::data::Sample;
use daq_core::error::{AppResult, DaqError};

fn decode_error(command: &str, reason: String) -> DaqError {
    DaqError::Decode {
        command: command.to_string(),
        reason,
    }
}

/// Decode a binary block payload.
///
/// Values are multiplied by the header's `2^exponent`; markers are not. A
/// scaled value that leaves the finite range becomes a marker.
///
/// # Errors
/// [`DaqError::Decode`] if the payload length disagrees with the header, is not
/// a whole number of elements, or contains NaN.
pub fn decode_block(
    payload: &[u8],
    header: &BlockHeader,
    format: SampleFormat,
    endian: Endian,
    command: &str,
) -> AppResult<Vec<Sample>> {
    if let Some(declared) = header.length {
        if declared != payload.len() {
            return Err(decode_error(
                command,
                format!(
                    "payload is {} bytes but header declares {}",
                    payload.len(),
                    declared
                ),
            ));
        }
    }

    let width = format.width();
    if payload.len() % width != 0 {
        return Err(decode_error(
            command,
            format!(
                "payload of {} bytes is not a whole number of {}-byte elements",
                payload.len(),
                width
            ),
        ));
    }

    let scale = header.scale();
    payload
        .chunks_exact(width)
        .enumerate()
        .map(|(index, bytes)| match format {
            SampleFormat::Float32 => {
                let raw = [bytes[0], bytes[1], bytes[2], bytes[3]];
                let value = match endian {
                    Endian::Little => f32::from_le_bytes(raw),
                    Endian::Big => f32::from_be_bytes(raw),
                };
                float_sample(f64::from(value), scale)
                    .ok_or_else(|| decode_error(command, format!("NaN at element {index}")))
            }
            SampleFormat::Int16 => {
                let raw = [bytes[0], bytes[1]];
                let value = match endian {
                    Endian::Little => i16::from_le_bytes(raw),
                    Endian::Big => i16::from_be_bytes(raw),
                };
                Ok(match value {
                    i16::MAX => Sample::Overflow,
                    i16::MIN => Sample::Underflow,
                    v => Sample::Value(f64::from(v)).scaled(scale),
                })
            }
        })
        .collect()
}

fn float_sample(value: f64, scale: f64) -> Option<Sample> {
    if value.is_nan() {
        None
    } else if value == f64::INFINITY {
        Some(Sample::Overflow)
    } else if value == f64::NEG_INFINITY {
        Some(Sample::Underflow)
    } else {
        Some(Sample::Value(value).scaled(scale))
    }
}

/// Decode one ASCII reading.
pub fn decode_ascii_value(token: &str, dialect: &Dialect, command: &str) -> AppResult<Sample> {
    let token = token.trim();
    if dialect.is_overflow(token) {
        return Ok(Sample::Overflow);
    }
    if dialect.is_underflow(token) {
        return Ok(Sample::Underflow);
    }
    let value: f64 = token
        .parse()
        .map_err(|_| decode_error(command, format!("'{token}' is not a number")))?;
    float_sample(value, 1.0).ok_or_else(|| decode_error(command, format!("'{token}' is NaN")))
}

/// Decode a separated list of ASCII readings.
///
/// A trailing separator is tolerated; an empty entry in the middle is not.
pub fn decode_ascii_list(text: &str, dialect: &Dialect, command: &str) -> AppResult<Vec<Sample>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let text = text
        .strip_suffix(dialect.argument_separator.as_str())
        .unwrap_or(text);
    text.split(dialect.argument_separator.as_str())
        .enumerate()
        .map(|(index, token)| {
            if token.trim().is_empty() {
                Err(decode_error(command, format!("empty entry at position {index}")))
            } else {
                decode_ascii_value(token, dialect, command)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_block(values: &[f32], endian: Endian) -> Vec<u8> {
        values
            .iter()
            .flat_map(|v| match endian {
                Endian::Little => v.to_le_bytes(),
                Endian::Big => v.to_be_bytes(),
            })
            .collect()
    }

    #[test]
    fn test_float32_known_values() {
        let payload = f32_block(&[1.0, -2.5, 0.0, 100.25], Endian::Little);
        let header = BlockHeader::sized(payload.len());
        let samples =
            decode_block(&payload, &header, SampleFormat::Float32, Endian::Little, "DSPB?").unwrap();
        assert_eq!(
            samples,
            vec![
                Sample::Value(1.0),
                Sample::Value(-2.5),
                Sample::Value(0.0),
                Sample::Value(100.25)
            ]
        );
    }

    #[test]
    fn test_float32_big_endian() {
        let payload = f32_block(&[3.5, -0.125], Endian::Big);
        let samples = decode_block(
            &payload,
            &BlockHeader::sized(8),
            SampleFormat::Float32,
            Endian::Big,
            "DSPB?",
        )
        .unwrap();
        assert_eq!(samples, vec![Sample::Value(3.5), Sample::Value(-0.125)]);
    }

    #[test]
    fn test_int16_with_exponent_and_sentinels() {
        let values: [i16; 4] = [100, -8, i16::MAX, i16::MIN];
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let header = BlockHeader {
            length: Some(8),
            exponent: -2,
        };
        let samples =
            decode_block(&payload, &header, SampleFormat::Int16, Endian::Little, "DSPB?").unwrap();
        assert_eq!(
            samples,
            vec![
                Sample::Value(25.0),
                Sample::Value(-2.0),
                Sample::Overflow,
                Sample::Underflow
            ]
        );
    }

    #[test]
    fn test_float_infinities_are_markers() {
        let payload = f32_block(&[f32::INFINITY, f32::NEG_INFINITY, 2.0], Endian::Little);
        let samples = decode_block(
            &payload,
            &BlockHeader::sized(12),
            SampleFormat::Float32,
            Endian::Little,
            "DSPB?",
        )
        .unwrap();
        assert_eq!(
            samples,
            vec![Sample::Overflow, Sample::Underflow, Sample::Value(2.0)]
        );
    }

    #[test]
    fn test_nan_is_decode_error() {
        let payload = f32_block(&[1.0, f32::NAN], Endian::Little);
        let err = decode_block(
            &payload,
            &BlockHeader::sized(8),
            SampleFormat::Float32,
            Endian::Little,
            "DSPB?",
        )
        .unwrap_err();
        assert!(err.to_string().contains("NaN at element 1"));
    }

    #[test]
    fn test_length_mismatches() {
        let payload = vec![0u8; 10];
        let err = decode_block(
            &payload,
            &BlockHeader::sized(12),
            SampleFormat::Float32,
            Endian::Little,
            "DSPB?",
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Decode { .. }));
        assert!(err.to_string().contains("header declares 12"));

        let err = decode_block(
            &payload,
            &BlockHeader::sized(10),
            SampleFormat::Float32,
            Endian::Little,
            "DSPB?",
        )
        .unwrap_err();
        assert!(err.to_string().contains("whole number"));
    }

    #[test]
    fn test_ascii_list() {
        let dialect = Dialect::default();
        let samples = decode_ascii_list("1.5, -2e3,OVER,under,", &dialect, "DSPY?").unwrap();
        assert_eq!(
            samples,
            vec![
                Sample::Value(1.5),
                Sample::Value(-2000.0),
                Sample::Overflow,
                Sample::Underflow
            ]
        );
        assert!(decode_ascii_list("", &dialect, "DSPY?").unwrap().is_empty());
    }

    #[test]
    fn test_ascii_errors() {
        let dialect = Dialect::default();
        assert!(decode_ascii_list("1.0,,2.0", &dialect, "DSPY?").is_err());
        assert!(decode_ascii_value("abc", &dialect, "DSPY?").is_err());
        assert!(decode_ascii_value("NaN", &dialect, "DSPY?").is_err());
        assert_eq!(
            decode_ascii_value("inf", &dialect, "DSPY?").unwrap(),
            Sample::Overflow
        );
    }
}
