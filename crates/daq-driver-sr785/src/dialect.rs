//! SR785 command dialect
//!
//! Every wire constant the protocol engine relies on lives in [`Dialect`]:
//! terminators, separators, echo mode, block header grammar, read budgets and
//! the ASCII overflow/underflow tokens. Nothing downstream hard-codes them, so a
//! simulated instrument or a different firmware revision only needs a different
//! `Dialect` value.
//!
//! Wire format:
//! - Commands: `MNEMONIC arg1,arg2,...<tx_terminator>`
//! - Scalar/status replies: one ASCII line ending in `rx_terminator`
//! - Block replies: `#<n><len>` followed by `len` payload bytes, where `n` is a
//!   single digit giving the number of length digits (`#0` means the payload runs
//!   to `rx_terminator`). The exponent variant appends `E<sign><two digits>`.

use crate::command::{Command, CommandLine, ReplyKind};
use crate::status::StatusRule;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Block header grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockHeaderFormat {
    /// `#<n><len>`
    #[default]
    Definite,
    /// `#<n><len>E<±dd>`, values scaled by 2^exponent
    DefiniteWithExponent,
}

/// Parsed block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    /// Payload length in bytes; `None` when terminator-delimited
    pub length: Option<usize>,
    /// Binary exponent applied to every decoded value
    pub exponent: i32,
}

impl BlockHeader {
    /// Header for a payload of known length with no exponent.
    pub fn sized(length: usize) -> Self {
        Self {
            length: Some(length),
            exponent: 0,
        }
    }

    /// Multiplier implied by the exponent.
    pub fn scale(&self) -> f64 {
        2f64.powi(self.exponent)
    }
}

impl BlockHeaderFormat {
    /// Total header length once the digit-count byte `n` is known.
    pub fn header_len(&self, digit_count: usize) -> usize {
        match self {
            BlockHeaderFormat::Definite => 2 + digit_count,
            BlockHeaderFormat::DefiniteWithExponent => 2 + digit_count + 4,
        }
    }

    /// Parse a complete header (marker included).
    ///
    /// `bytes` must be exactly [`header_len`](Self::header_len) long.
    pub fn parse(&self, marker: u8, bytes: &[u8]) -> Result<BlockHeader, String> {
        if bytes.len() < 2 || bytes[0] != marker {
            return Err(format!("block reply does not start with '{}'", marker as char));
        }
        let digit_count = digit_value(bytes[1])
            .ok_or_else(|| format!("invalid length digit count {:?}", bytes[1] as char))?;
        if bytes.len() != self.header_len(digit_count) {
            return Err(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                self.header_len(digit_count)
            ));
        }

        let length_digits = &bytes[2..2 + digit_count];
        let length = if digit_count == 0 {
            None
        } else {
            let text = std::str::from_utf8(length_digits)
                .map_err(|_| "length field is not ASCII".to_string())?;
            Some(
                text.parse::<usize>()
                    .map_err(|_| format!("invalid length field {text:?}"))?,
            )
        };

        let exponent = match self {
            BlockHeaderFormat::Definite => 0,
            BlockHeaderFormat::DefiniteWithExponent => {
                let field = &bytes[2 + digit_count..];
                if field[0] != b'E' && field[0] != b'e' {
                    return Err(format!(
                        "expected exponent marker 'E', found {:?}",
                        field[0] as char
                    ));
                }
                let text = std::str::from_utf8(&field[1..])
                    .map_err(|_| "exponent field is not ASCII".to_string())?;
                text.parse::<i32>()
                    .map_err(|_| format!("invalid exponent {text:?}"))?
            }
        };

        Ok(BlockHeader { length, exponent })
    }
}

/// Value of an ASCII decimal digit.
pub(crate) fn digit_value(byte: u8) -> Option<usize> {
    byte.is_ascii_digit().then(|| usize::from(byte - b'0'))
}

/// Wire constants for one instrument link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dialect {
    /// Appended to every command line
    pub tx_terminator: String,
    /// Ends every ASCII reply line
    pub rx_terminator: char,
    /// Between mnemonic and first argument
    pub mnemonic_separator: String,
    /// Between arguments
    pub argument_separator: String,
    /// Link echoes each command line before replying
    pub echo: bool,
    /// First byte of a block header
    pub block_marker: char,
    /// Block header grammar
    pub block_header: BlockHeaderFormat,
    /// Block payloads are followed by `rx_terminator`
    pub block_trailer: bool,
    /// Settle time after each write
    #[serde(with = "humantime_serde")]
    pub command_delay: Duration,
    /// Bytes requested per read
    pub read_chunk: usize,
    /// Consecutive empty reads tolerated mid-reply
    pub max_empty_reads: u32,
    /// Drain attempts during resynchronization
    pub drain_rounds: u32,
    /// ASCII tokens meaning overflow
    pub overflow_tokens: Vec<String>,
    /// ASCII tokens meaning underflow
    pub underflow_tokens: Vec<String>,
    /// Identify query, also the connect handshake
    pub identify_command: String,
    /// Reset command
    pub reset_command: String,
    /// Default status rule
    pub status: StatusRule,
    /// Non-latching busy query checked before new operations
    ///
    /// The SR785 completion bits clear on read, so the default status rule
    /// cannot tell "idle" from "finished and already read". Leave unset to rely
    /// on the session's record of outstanding acquisitions alone.
    pub busy_check: Option<StatusRule>,
}

impl Default for Dialect {
    fn default() -> Self {
        Self {
            tx_terminator: "\n".to_string(),
            rx_terminator: '\n',
            mnemonic_separator: " ".to_string(),
            argument_separator: ",".to_string(),
            echo: false,
            block_marker: '#',
            block_header: BlockHeaderFormat::Definite,
            block_trailer: true,
            command_delay: Duration::from_millis(100),
            read_chunk: 256,
            max_empty_reads: 3,
            drain_rounds: 8,
            overflow_tokens: vec!["OVER".to_string(), "+INF".to_string()],
            underflow_tokens: vec!["UNDER".to_string(), "-INF".to_string()],
            identify_command: "*IDN?".to_string(),
            reset_command: "*RST".to_string(),
            status: StatusRule::default(),
            busy_check: None,
        }
    }
}

impl Dialect {
    /// Terminator as a byte.
    pub fn rx_byte(&self) -> u8 {
        // validate() guarantees ASCII
        self.rx_terminator as u8
    }

    /// Block marker as a byte.
    pub fn marker_byte(&self) -> u8 {
        self.block_marker as u8
    }

    /// Encode a command as the bytes to put on the wire.
    pub fn encode(&self, command: &Command) -> Vec<u8> {
        let mut line = command.mnemonic.clone();
        if !command.args.is_empty() {
            line.push_str(&self.mnemonic_separator);
            line.push_str(&command.args.join(&self.argument_separator));
        }
        line.push_str(&self.tx_terminator);
        line.into_bytes()
    }

    /// Recover mnemonic and arguments from a command line.
    ///
    /// Exact inverse of [`encode`](Self::encode) for mnemonics and arguments
    /// that do not contain the separators. Trailing terminators are ignored.
    pub fn decode_line(&self, line: &str) -> CommandLine {
        let line = line
            .strip_suffix(self.tx_terminator.as_str())
            .unwrap_or(line)
            .trim_end_matches(['\r', '\n', self.rx_terminator]);

        let split = if self.mnemonic_separator.is_empty() {
            None
        } else {
            line.split_once(self.mnemonic_separator.as_str())
        };

        match split {
            Some((mnemonic, rest)) => CommandLine {
                mnemonic: mnemonic.to_string(),
                args: if self.argument_separator.is_empty() {
                    vec![rest.to_string()]
                } else {
                    rest.split(self.argument_separator.as_str())
                        .map(str::to_string)
                        .collect()
                },
            },
            None => CommandLine {
                mnemonic: line.to_string(),
                args: Vec::new(),
            },
        }
    }

    /// Build a command from a raw line such as `ASCL 0` or `STRT`.
    pub fn parse_command(&self, line: &str, reply: ReplyKind) -> Command {
        let parsed = self.decode_line(line.trim());
        Command::new(parsed.mnemonic, reply).args(parsed.args)
    }

    /// Whether `token` is an overflow sentinel.
    pub fn is_overflow(&self, token: &str) -> bool {
        self.overflow_tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Whether `token` is an underflow sentinel.
    pub fn is_underflow(&self, token: &str) -> bool {
        self.underflow_tokens.iter().any(|t| t.eq_ignore_ascii_case(token))
    }

    /// Reject values that would break framing.
    pub fn validate(&self) -> Result<(), String> {
        if self.tx_terminator.is_empty() {
            return Err("tx_terminator must not be empty".into());
        }
        if !self.rx_terminator.is_ascii() {
            return Err("rx_terminator must be an ASCII character".into());
        }
        if !self.block_marker.is_ascii() {
            return Err("block_marker must be an ASCII character".into());
        }
        if self.argument_separator.is_empty() {
            return Err("argument_separator must not be empty".into());
        }
        if self.echo && self.mnemonic_separator.is_empty() {
            return Err("echo verification needs a non-empty mnemonic_separator".into());
        }
        if self.read_chunk == 0 {
            return Err("read_chunk must be positive".into());
        }
        if self.max_empty_reads == 0 {
            return Err("max_empty_reads must be positive".into());
        }
        if self.status.command.trim().is_empty() {
            return Err("status command must not be empty".into());
        }
        if let Some(rule) = &self.busy_check {
            if rule.command.trim().is_empty() {
                return Err("busy_check command must not be empty".into());
            }
        }
        Ok(())
    }
}
