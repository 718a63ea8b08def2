//! Command Protocol Engine
//!
//! Turns [`Command`]s into bytes and replies into [`Response`]s over any
//! [`Transport`]. One exchange is in flight at a time.
//!
//! # Framing
//!
//! - ASCII replies are read up to the dialect's `rx_terminator`.
//! - Block replies are read header first, then looped until the declared byte
//!   count arrives. `max_empty_reads` consecutive empty reads end the transfer
//!   with [`DaqError::IncompleteTransfer`]; a short buffer is never returned.
//! - A `#0` header declares no length. The payload is read until the line goes
//!   quiet and must end with `rx_terminator`; terminator bytes inside the
//!   binary data are kept.
//!
//! # Resynchronization
//!
//! When an exchange fails after bytes went out, the engine discards everything
//! it buffered and drains the transport until a read comes back empty. If the
//! line never goes quiet within `drain_rounds`, the engine is marked
//! desynchronized and refuses further exchanges with [`DaqError::Connection`].

use crate::command::{BlockPolicy, Command, ReplyKind, Response};
use crate::dialect::{digit_value, BlockHeader, Dialect};
use crate::status::{InstrumentStatus, PollConfig, StatusRule};
use daq_core::error::{AppResult, DaqError};
use daq_core::serial::Transport;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, trace, warn};

/// Upper bound on a block without a declared length.
const MAX_INDEFINITE_BLOCK: usize = 1 << 20;

/// Synchronous request/response engine over one transport.
pub struct ProtocolEngine<T: Transport> {
    transport: T,
    dialect: Dialect,
    read_timeout: Duration,
    write_retries: u32,
    /// Bytes read from the transport but not yet consumed by a reply
    pending: Vec<u8>,
    desynchronized: bool,
}

impl<T: Transport> ProtocolEngine<T> {
    /// Wrap a transport.
    pub fn new(transport: T, dialect: Dialect, read_timeout: Duration, write_retries: u32) -> Self {
        Self {
            transport,
            dialect,
            read_timeout,
            write_retries,
            pending: Vec::new(),
            desynchronized: false,
        }
    }

    /// Wire constants in use.
    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Give the transport back.
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// True once resynchronization has failed.
    pub fn is_desynchronized(&self) -> bool {
        self.desynchronized
    }

    /// Send one command and read its reply.
    ///
    /// On failure the engine resynchronizes before returning the error, so the
    /// next exchange starts on a clean line.
    #[instrument(skip(self, command), fields(command = %command.mnemonic), err)]
    pub fn exchange(&mut self, command: &Command) -> AppResult<Response> {
        if self.desynchronized {
            return Err(self.desync_error());
        }

        match self.exchange_inner(command) {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Exchange '{}' failed, resynchronizing: {}", command.mnemonic, e);
                self.resync();
                Err(e)
            }
        }
    }

    fn exchange_inner(&mut self, command: &Command) -> AppResult<Response> {
        if !self.pending.is_empty() {
            warn!(
                "Discarding {} unread bytes before '{}'",
                self.pending.len(),
                command.mnemonic
            );
            self.pending.clear();
        }

        let bytes = self.dialect.encode(command);
        debug!("-> {}", String::from_utf8_lossy(&bytes).trim_end());
        self.transport
            .write_all_with_retry(&bytes, self.write_retries, &command.mnemonic)?;

        if !self.dialect.command_delay.is_zero() {
            thread::sleep(self.dialect.command_delay);
        }

        if self.dialect.echo {
            self.verify_echo(command, &bytes)?;
        }

        let response = match command.reply {
            ReplyKind::None => Response::None,
            ReplyKind::Status => {
                let line = self.read_line(&command.mnemonic)?;
                Response::Status(parse_status(&command.mnemonic, &line)?)
            }
            ReplyKind::Scalar => {
                let line = self.read_line(&command.mnemonic)?;
                Response::Scalar(parse_scalar(&command.mnemonic, &line)?)
            }
            ReplyKind::Text => Response::Text(self.read_line(&command.mnemonic)?),
            ReplyKind::Block(policy) => self.read_block(&command.mnemonic, policy)?,
        };

        match &response {
            Response::Block { payload, header } => {
                debug!("<- block of {} bytes (exponent {})", payload.len(), header.exponent)
            }
            Response::None => {}
            other => debug!("<- {:?}", other),
        }
        Ok(response)
    }

    fn verify_echo(&mut self, command: &Command, sent: &[u8]) -> AppResult<()> {
        let echo = self.read_line(&command.mnemonic)?;
        let expected = self.dialect.decode_line(&String::from_utf8_lossy(sent));
        let got = self.dialect.decode_line(&echo);
        if got != expected {
            return Err(DaqError::Protocol {
                command: command.mnemonic.clone(),
                reply: echo,
                reason: "echo does not match the command sent".into(),
            });
        }
        trace!("echo verified for '{}'", command.mnemonic);
        Ok(())
    }

    /// Read one chunk into `pending`; returns bytes added.
    fn read_more(&mut self, command: &str) -> AppResult<usize> {
        let mut buf = vec![0u8; self.dialect.read_chunk];
        let n = self
            .transport
            .read(&mut buf, self.read_timeout)
            .map_err(|e| DaqError::Transport {
                command: command.to_string(),
                reason: format!("read failed: {e}"),
            })?;
        self.pending.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    /// Read until `pending` holds at least `n` bytes.
    ///
    /// Returns `false` when the empty-read budget ran out first.
    fn fill_to(&mut self, command: &str, n: usize) -> AppResult<bool> {
        let mut empty_reads = 0;
        while self.pending.len() < n {
            if self.read_more(command)? == 0 {
                empty_reads += 1;
                if empty_reads >= self.dialect.max_empty_reads {
                    return Ok(false);
                }
            } else {
                empty_reads = 0;
            }
        }
        Ok(true)
    }

    /// Read until `terminator` is buffered; returns the bytes before it.
    ///
    /// `Err(received)` carries the number of bytes seen when the budget ran out.
    fn read_until(&mut self, command: &str, terminator: u8) -> AppResult<Result<Vec<u8>, usize>> {
        let mut empty_reads = 0;
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.pending[scanned..].iter().position(|b| *b == terminator) {
                let end = scanned + pos;
                let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                line.pop();
                return Ok(Ok(line));
            }
            scanned = self.pending.len();

            if self.read_more(command)? == 0 {
                empty_reads += 1;
                if empty_reads >= self.dialect.max_empty_reads {
                    return Ok(Err(self.pending.len()));
                }
            } else {
                empty_reads = 0;
            }
        }
    }

    /// Read one non-empty ASCII line.
    fn read_line(&mut self, command: &str) -> AppResult<String> {
        let terminator = self.dialect.rx_byte();
        loop {
            match self.read_until(command, terminator)? {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    let text = text.trim_end_matches('\r');
                    // Blank lines are stray trailers from an earlier block
                    if text.trim().is_empty() {
                        continue;
                    }
                    return Ok(text.to_string());
                }
                Err(received) => {
                    return Err(DaqError::Protocol {
                        command: command.to_string(),
                        reply: String::from_utf8_lossy(&self.pending).into_owned(),
                        reason: if received == 0 {
                            format!("no reply after {} empty reads", self.dialect.max_empty_reads)
                        } else {
                            "reply not terminated".to_string()
                        },
                    })
                }
            }
        }
    }

    fn read_block(&mut self, command: &str, policy: BlockPolicy) -> AppResult<Response> {
        let (payload, header) = match policy {
            BlockPolicy::Fixed(len) => {
                let payload = self.read_exact_payload(command, 0, len)?;
                (payload, BlockHeader::sized(len))
            }
            BlockPolicy::Terminated(byte) => {
                let payload = self.read_terminated_payload(command, byte)?;
                let header = BlockHeader::sized(payload.len());
                return Ok(Response::Block { payload, header });
            }
            BlockPolicy::LengthPrefixed => {
                let header = self.read_header(command)?;
                match header.length {
                    Some(len) => (self.read_exact_payload(command, 0, len)?, header),
                    None => {
                        let terminator = self.dialect.rx_byte();
                        let payload = self.read_indefinite_payload(command, terminator)?;
                        let header = BlockHeader {
                            length: Some(payload.len()),
                            ..header
                        };
                        return Ok(Response::Block { payload, header });
                    }
                }
            }
        };

        if self.dialect.block_trailer {
            self.consume_trailer(command)?;
        }
        Ok(Response::Block { payload, header })
    }

    fn read_header(&mut self, command: &str) -> AppResult<BlockHeader> {
        let format = self.dialect.block_header;
        let marker = self.dialect.marker_byte();

        if !self.fill_to(command, 2)? {
            return Err(DaqError::Protocol {
                command: command.to_string(),
                reply: String::from_utf8_lossy(&self.pending).into_owned(),
                reason: "no block header received".into(),
            });
        }

        let header_error = |pending: &[u8], reason: String| DaqError::Protocol {
            command: command.to_string(),
            reply: String::from_utf8_lossy(&pending[..pending.len().min(16)]).into_owned(),
            reason,
        };

        if self.pending[0] != marker {
            return Err(header_error(
                &self.pending,
                format!("block reply does not start with '{}'", marker as char),
            ));
        }
        let Some(digit_count) = digit_value(self.pending[1]) else {
            return Err(header_error(&self.pending, "invalid length digit count".into()));
        };

        let header_len = format.header_len(digit_count);
        if !self.fill_to(command, header_len)? {
            return Err(header_error(&self.pending, "block header truncated".into()));
        }

        let header = format
            .parse(marker, &self.pending[..header_len])
            .map_err(|reason| header_error(&self.pending, reason))?;
        self.pending.drain(..header_len);
        trace!(?header, "block header");
        Ok(header)
    }

    fn read_exact_payload(&mut self, command: &str, offset: usize, len: usize) -> AppResult<Vec<u8>> {
        if !self.fill_to(command, offset + len)? {
            return Err(DaqError::IncompleteTransfer {
                command: command.to_string(),
                expected: len,
                received: self.pending.len().saturating_sub(offset),
            });
        }
        Ok(self.pending.drain(offset..offset + len).collect())
    }

    fn read_terminated_payload(&mut self, command: &str, terminator: u8) -> AppResult<Vec<u8>> {
        match self.read_until(command, terminator)? {
            Ok(payload) => Ok(payload),
            Err(received) => Err(DaqError::IncompleteTransfer {
                command: command.to_string(),
                // Unknown length: the terminator is the missing byte
                expected: received + 1,
                received,
            }),
        }
    }

    /// Read until the line is quiet, then strip the final terminator.
    fn read_indefinite_payload(&mut self, command: &str, terminator: u8) -> AppResult<Vec<u8>> {
        let mut empty_reads = 0;
        while empty_reads < self.dialect.max_empty_reads {
            if self.pending.len() > MAX_INDEFINITE_BLOCK {
                return Err(DaqError::Protocol {
                    command: command.to_string(),
                    reply: String::from_utf8_lossy(&self.pending[..16]).into_owned(),
                    reason: format!("block without length exceeds {MAX_INDEFINITE_BLOCK} bytes"),
                });
            }
            if self.read_more(command)? == 0 {
                empty_reads += 1;
            } else {
                empty_reads = 0;
            }
        }

        if self.pending.last() != Some(&terminator) {
            let received = self.pending.len();
            return Err(DaqError::IncompleteTransfer {
                command: command.to_string(),
                expected: received + 1,
                received,
            });
        }
        self.pending.pop();
        Ok(std::mem::take(&mut self.pending))
    }

    fn consume_trailer(&mut self, command: &str) -> AppResult<()> {
        let terminator = self.dialect.rx_byte();
        if self.pending.is_empty() && !self.fill_to(command, 1)? {
            trace!("no block trailer for '{}'", command);
            return Ok(());
        }
        if self.pending.first() == Some(&terminator) {
            self.pending.remove(0);
        }
        Ok(())
    }

    /// Discard buffered input and drain the line until it goes quiet.
    pub fn resync(&mut self) {
        self.pending.clear();

        if let Err(e) = self.transport.clear_input() {
            warn!("Failed to clear input on {}: {}", self.transport.describe(), e);
            self.desynchronized = true;
            return;
        }

        let mut buf = vec![0u8; self.dialect.read_chunk];
        let mut discarded = 0usize;
        for round in 0..self.dialect.drain_rounds {
            match self.transport.read(&mut buf, self.read_timeout) {
                Ok(0) => {
                    debug!(
                        "Line quiet after {} drain rounds ({} bytes discarded)",
                        round, discarded
                    );
                    return;
                }
                Ok(n) => discarded += n,
                Err(e) => {
                    warn!("Drain read failed on {}: {}", self.transport.describe(), e);
                    self.desynchronized = true;
                    return;
                }
            }
        }

        warn!(
            "Line on {} still busy after {} drain rounds, session desynchronized",
            self.transport.describe(),
            self.dialect.drain_rounds
        );
        self.desynchronized = true;
    }

    fn desync_error(&self) -> DaqError {
        DaqError::Connection {
            port: self.transport.describe(),
            reason: "session lost framing after a failed exchange; reconnect".into(),
        }
    }

    /// Query the status word and classify it.
    pub fn read_status(&mut self, rule: &StatusRule) -> AppResult<InstrumentStatus> {
        let query = Command::status(&rule.command).args(&rule.args);
        match self.exchange(&query)? {
            Response::Status(word) => Ok(rule.classify(word)),
            other => Err(unexpected_reply(&rule.command, &other, "status")),
        }
    }

    /// Poll the status query until it reports Idle.
    ///
    /// Returns the number of polls issued.
    pub fn poll_until_idle(&mut self, rule: &StatusRule, poll: &PollConfig) -> AppResult<u32> {
        self.poll_until_idle_with(rule, poll, |_, _, _| Ok(()))
    }

    /// Like [`poll_until_idle`](Self::poll_until_idle), calling `on_poll` after
    /// every non-idle poll (progress queries go here).
    ///
    /// # Errors
    /// - [`DaqError::Timeout`] if Idle is not seen within `poll.timeout`
    /// - [`DaqError::InstrumentFault`] if the status word carries error bits
    /// - [`DaqError::Configuration`] if `poll` fails [`PollConfig::validate`]
    #[instrument(skip(self, rule, poll, on_poll), fields(status = %rule.command), err)]
    pub fn poll_until_idle_with<F>(
        &mut self,
        rule: &StatusRule,
        poll: &PollConfig,
        on_poll: F,
    ) -> AppResult<u32>
    where
        F: FnMut(&mut Self, u32, InstrumentStatus) -> AppResult<()>,
    {
        poll_status(self, rule, poll, |engine, rule| engine.read_status(rule), on_poll)
    }
}

/// Bounded status polling loop shared by the engine and the session.
///
/// `read` queries the status once; `on_poll` runs after every non-idle poll.
/// Returns the number of polls issued.
pub(crate) fn poll_status<C, R, F>(
    ctx: &mut C,
    rule: &StatusRule,
    poll: &PollConfig,
    mut read: R,
    mut on_poll: F,
) -> AppResult<u32>
where
    R: FnMut(&mut C, &StatusRule) -> AppResult<InstrumentStatus>,
    F: FnMut(&mut C, u32, InstrumentStatus) -> AppResult<()>,
{
    poll.validate().map_err(DaqError::Configuration)?;

    let start = Instant::now();
    let mut interval = poll.interval;
    let mut polls = 0u32;

    loop {
        polls += 1;
        let status = read(ctx, rule)?;
        trace!(polls, %status, "status poll");

        match status {
            InstrumentStatus::Idle => {
                debug!("Idle after {} polls ({:?})", polls, start.elapsed());
                return Ok(polls);
            }
            InstrumentStatus::Error(code) => {
                return Err(DaqError::InstrumentFault {
                    command: rule.command.clone(),
                    code,
                })
            }
            InstrumentStatus::Busy | InstrumentStatus::Triggered => {
                on_poll(ctx, polls, status)?;
            }
        }

        let elapsed = start.elapsed();
        if elapsed >= poll.timeout {
            return Err(DaqError::Timeout {
                operation: rule.command.clone(),
                waited: elapsed,
            });
        }
        thread::sleep(interval.min(poll.timeout - elapsed));
        interval = poll.next_interval(interval);
    }
}

fn parse_status(command: &str, line: &str) -> AppResult<i64> {
    line.trim().parse::<i64>().map_err(|_| DaqError::Protocol {
        command: command.to_string(),
        reply: line.to_string(),
        reason: "expected an integer status word".into(),
    })
}

fn parse_scalar(command: &str, line: &str) -> AppResult<f64> {
    line.trim().parse::<f64>().map_err(|_| DaqError::Protocol {
        command: command.to_string(),
        reply: line.to_string(),
        reason: "expected a numeric reply".into(),
    })
}

/// Protocol error for a reply of the wrong kind.
pub(crate) fn unexpected_reply(command: &str, got: &Response, expected: &str) -> DaqError {
    DaqError::Protocol {
        command: command.to_string(),
        reply: format!("{got:?}"),
        reason: format!("expected a {expected} reply, got {}", got.kind()),
    }
}
