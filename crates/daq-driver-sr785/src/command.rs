//! Outbound commands and decoded responses.

use crate::dialect::BlockHeader;
use std::fmt;

/// How many bytes a block reply carries.
///
/// A [`ReplyKind::Block`] cannot be built without one of these, so every block
/// command declares its length policy up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockPolicy {
    /// Exactly this many payload bytes, no header
    Fixed(usize),
    /// Payload preceded by a header in the dialect's block header grammar
    LengthPrefixed,
    /// Payload runs until this byte (not included)
    Terminated(u8),
}

/// Reply expected after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// Setting command, nothing comes back
    None,
    /// Integer status word
    Status,
    /// One ASCII number
    Scalar,
    /// One ASCII line, returned verbatim
    Text,
    /// Binary payload
    Block(BlockPolicy),
}

/// An outbound instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Instrument mnemonic, e.g. `FSPN` or `DSPS?`
    pub mnemonic: String,
    /// Arguments in order
    pub args: Vec<String>,
    /// Reply to expect
    pub reply: ReplyKind,
}

impl Command {
    /// Command with an explicit reply kind.
    pub fn new(mnemonic: impl Into<String>, reply: ReplyKind) -> Self {
        Self {
            mnemonic: mnemonic.into(),
            args: Vec::new(),
            reply,
        }
    }

    /// Setting command with no reply.
    pub fn set(mnemonic: impl Into<String>) -> Self {
        Self::new(mnemonic, ReplyKind::None)
    }

    /// Query returning a raw text line.
    pub fn text(mnemonic: impl Into<String>) -> Self {
        Self::new(mnemonic, ReplyKind::Text)
    }

    /// Numeric query.
    pub fn scalar(mnemonic: impl Into<String>) -> Self {
        Self::new(mnemonic, ReplyKind::Scalar)
    }

    /// Status word query.
    pub fn status(mnemonic: impl Into<String>) -> Self {
        Self::new(mnemonic, ReplyKind::Status)
    }

    /// Binary dump with the given length policy.
    pub fn block(mnemonic: impl Into<String>, policy: BlockPolicy) -> Self {
        Self::new(mnemonic, ReplyKind::Block(policy))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    /// Whether any bytes come back for this command.
    pub fn expects_reply(&self) -> bool {
        self.reply != ReplyKind::None
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mnemonic)?;
        if !self.args.is_empty() {
            write!(f, " {}", self.args.join(","))?;
        }
        Ok(())
    }
}

/// Mnemonic and arguments recovered from a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Mnemonic
    pub mnemonic: String,
    /// Arguments in order
    pub args: Vec<String>,
}

/// Decoded reply to one command.
///
/// Produced per exchange and handed straight to the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// The command expected no reply
    None,
    /// Integer status word
    Status(i64),
    /// Numeric reply
    Scalar(f64),
    /// Raw text line, terminator removed
    Text(String),
    /// Binary payload with the header that framed it
    Block {
        /// Payload bytes, header and trailer removed
        payload: Vec<u8>,
        /// Header metadata (length, exponent)
        header: BlockHeader,
    },
}

impl Response {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::None => "none",
            Response::Status(_) => "status",
            Response::Scalar(_) => "scalar",
            Response::Text(_) => "text",
            Response::Block { .. } => "block",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_display() {
        let cmd = Command::set("FSPN").arg(2).arg("102400");
        assert_eq!(cmd.args, vec!["2", "102400"]);
        assert_eq!(cmd.to_string(), "FSPN 2,102400");
        assert!(!cmd.expects_reply());

        let q = Command::block("DSPB?", BlockPolicy::LengthPrefixed).args([0]);
        assert_eq!(q.reply, ReplyKind::Block(BlockPolicy::LengthPrefixed));
        assert!(q.expects_reply());
    }
}
