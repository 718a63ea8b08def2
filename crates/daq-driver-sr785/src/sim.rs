//! Simulated SR785 for tests and dry runs
//!
//! [`SimulatedInstrument`] implements [`Transport`] entirely in memory. It parses
//! each complete command line it receives, logs it, and queues a scripted reply.
//! A cloned [`SimHandle`] shares the same state so a test can script replies
//! before the session takes ownership of the transport, and inspect the command
//! log afterwards.
//!
//! # Scripting
//!
//! - `respond` / `respond_raw` / `respond_block` / `respond_indexed`: fixed replies
//!   per mnemonic
//! - `acquisition`: after the trigger the status word reads 0 for N polls, then
//!   the completion bit latches: it reads 1 once and clears on that read
//! - `status_sequence`: explicit status words; the last one repeats
//! - `truncate_next_block`, `set_chunk_size`, `set_echo`, `set_noise`,
//!   `fail_writes`: transport faults
//!
//! A reply registered as `<MNEMONIC> <first arg>` (for example `DSPY? 1`)
//! takes precedence over one registered for the bare mnemonic, which is how
//! per-display data is scripted.
//!
//! Setting commands are remembered, so a query `<MNEMONIC>? <args>` of an
//! unscripted mnemonic answers with the last value set.
//!
//! ```
//! use daq_driver_sr785::sim::SimulatedInstrument;
//! use daq_driver_sr785::{Command, Session};
//!
//! let sim = SimulatedInstrument::new();
//! let handle = sim.handle();
//! handle.respond("FSPN?", "102400");
//!
//! let mut session = Session::simulated(sim);
//! let span = session.query_scalar(&Command::scalar("FSPN?").arg(0))?;
//! assert_eq!(span, 102400.0);
//! assert_eq!(handle.commands(), vec!["FSPN? 0"]);
//! # Ok::<(), daq_core::DaqError>(())
//! ```

use crate::dialect::Dialect;
use daq_core::serial::Transport;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Identification string returned for `*IDN?`.
pub const SIM_IDENTITY: &str = "Stanford_Research_Systems,SR785,s/n00000,ver1.0-sim";

#[derive(Debug, Clone)]
enum Responder {
    Line(String),
    Raw(Vec<u8>),
    Block(Vec<u8>),
    Indexed(Vec<String>),
    Status(VecDeque<i64>),
}

#[derive(Debug, Clone)]
struct Acquisition {
    trigger: String,
    status: String,
    busy_polls: usize,
    remaining: usize,
    running: bool,
}

#[derive(Debug, Default)]
struct SimState {
    responders: HashMap<String, Responder>,
    settings: HashMap<String, Vec<String>>,
    acquisition: Option<Acquisition>,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    log: Vec<String>,
    bytes_written: usize,
    chunk_size: Option<usize>,
    truncate_next: Option<usize>,
    echo: bool,
    noise: bool,
    fail_writes: bool,
}

impl SimState {
    fn handle_line(&mut self, line: &str) {
        trace!("sim <- {}", line);
        self.log.push(line.to_string());

        if self.echo {
            self.queue_line(line);
        }

        let (mnemonic, args) = match line.split_once(' ') {
            Some((m, rest)) => (m, rest.split(',').map(str::to_string).collect()),
            None => (line, Vec::new()),
        };

        if let Some(acq) = self.acquisition.as_mut() {
            if mnemonic == acq.trigger {
                acq.remaining = acq.busy_polls;
                acq.running = true;
            }
        }

        let key = args
            .first()
            .map(|first| format!("{mnemonic} {}", first.trim()))
            .filter(|key| self.responders.contains_key(key))
            .unwrap_or_else(|| mnemonic.to_string());

        if let Some(responder) = self.responders.get_mut(&key) {
            match responder {
                Responder::Line(text) => {
                    let text = text.clone();
                    self.queue_line(&text);
                }
                Responder::Raw(bytes) => {
                    let bytes = bytes.clone();
                    self.outbound.extend(bytes);
                }
                Responder::Block(payload) => {
                    let payload = payload.clone();
                    self.queue_block(&payload);
                }
                Responder::Indexed(values) => {
                    let index = args.last().and_then(|a| a.trim().parse::<usize>().ok());
                    if let Some(value) = index.and_then(|i| values.get(i)).cloned() {
                        self.queue_line(&value);
                    }
                }
                Responder::Status(words) => {
                    let word = if words.len() > 1 {
                        words.pop_front()
                    } else {
                        words.front().copied()
                    };
                    if let Some(word) = word {
                        self.queue_line(&word.to_string());
                    }
                }
            }
            return;
        }

        if let Some(acq) = self.acquisition.as_mut() {
            if mnemonic == acq.status {
                let word = if !acq.running {
                    0
                } else if acq.remaining > 0 {
                    acq.remaining -= 1;
                    0
                } else {
                    // latched completion clears on read
                    acq.running = false;
                    1
                };
                self.queue_line(&word.to_string());
                return;
            }
        }

        match mnemonic.strip_suffix('?') {
            Some(setting) => {
                if let Some(value) = self.settings.get(setting).and_then(|v| v.last()).cloned() {
                    self.queue_line(&value);
                }
            }
            None => {
                self.settings.insert(mnemonic.to_string(), args);
            }
        }
    }

    fn queue_line(&mut self, text: &str) {
        self.outbound.extend(text.as_bytes());
        self.outbound.push_back(b'\n');
    }

    fn queue_block(&mut self, payload: &[u8]) {
        let len = payload.len().to_string();
        let header = format!("#{}{}", len.len(), len);
        self.outbound.extend(header.as_bytes());
        match self.truncate_next.take() {
            Some(keep) => self.outbound.extend(&payload[..keep.min(payload.len())]),
            None => {
                self.outbound.extend(payload);
                self.outbound.push_back(b'\n');
            }
        }
    }
}

/// In-memory instrument implementing [`Transport`].
#[derive(Debug)]
pub struct SimulatedInstrument {
    state: Arc<Mutex<SimState>>,
}

/// Test-side view of a [`SimulatedInstrument`].
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for SimulatedInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInstrument {
    /// A blank instrument that only answers `*IDN?`.
    pub fn new() -> Self {
        let sim = Self {
            state: Arc::new(Mutex::new(SimState::default())),
        };
        sim.handle().respond("*IDN?", SIM_IDENTITY);
        sim
    }

    /// An instrument preloaded with a plausible spectrum measurement.
    ///
    /// Answers the status, progress and dump queries used by the bundled
    /// templates: a 3-poll acquisition after `STRT`, 8-bin float32 traces on
    /// displays 0 and 1 sharing one frequency axis, and per-bin ASCII readout
    /// through `DBIN?`/`DSPY?`.
    pub fn sr785() -> Self {
        let sim = Self::new();
        let handle = sim.handle();
        handle.acquisition("STRT", "DSPS?", 3);
        handle.respond("NAVG?", "4");
        handle.respond("FAVN?", "10");
        handle.respond("SSFR?", "1000");

        let bins: Vec<f64> = (0..8u8).map(|i| f64::from(i) * 12.5).collect();
        let levels: Vec<f32> = vec![-80.0, -62.5, -41.0, -20.25, -20.5, -44.0, -70.0, f32::INFINITY];
        let phases: Vec<f32> = vec![0.0, -12.5, -45.0, -90.0, -135.0, -170.0, -178.5, -180.0];

        let x_block: Vec<u8> = bins.iter().flat_map(|f| (*f as f32).to_le_bytes()).collect();
        let y_block: Vec<u8> = levels.iter().flat_map(|v| v.to_le_bytes()).collect();
        let phase_block: Vec<u8> = phases.iter().flat_map(|v| v.to_le_bytes()).collect();
        handle.respond_block("DSPX?", x_block);
        handle.respond_block("DSPB?", y_block);
        handle.respond_block("DSPB? 1", phase_block);

        handle.respond("DSPN?", &bins.len().to_string());
        handle.respond_indexed("DBIN?", bins.iter().map(|f| f.to_string()));
        handle.respond_indexed(
            "DSPY?",
            levels.iter().map(|v| {
                if v.is_infinite() {
                    "OVER".to_string()
                } else {
                    v.to_string()
                }
            }),
        );
        handle.respond_indexed("DSPY? 1", phases.iter().map(|v| v.to_string()));
        sim
    }

    /// Dialect with no settle delay and small read budgets.
    pub fn dialect() -> Dialect {
        Dialect {
            command_delay: Duration::ZERO,
            max_empty_reads: 2,
            drain_rounds: 4,
            ..Dialect::default()
        }
    }

    /// Handle sharing this instrument's state.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl SimHandle {
    /// Reply to `mnemonic` with one ASCII line.
    pub fn respond(&self, mnemonic: &str, reply: &str) {
        lock(&self.state)
            .responders
            .insert(mnemonic.to_string(), Responder::Line(reply.to_string()));
    }

    /// Reply to `mnemonic` with exact bytes (no terminator added).
    pub fn respond_raw(&self, mnemonic: &str, bytes: Vec<u8>) {
        lock(&self.state)
            .responders
            .insert(mnemonic.to_string(), Responder::Raw(bytes));
    }

    /// Reply to `mnemonic` with a `#<n><len>` framed block and a trailing newline.
    pub fn respond_block(&self, mnemonic: &str, payload: Vec<u8>) {
        lock(&self.state)
            .responders
            .insert(mnemonic.to_string(), Responder::Block(payload));
    }

    /// Reply with `values[i]`, where `i` is the last argument of the query.
    pub fn respond_indexed<I, S>(&self, mnemonic: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        lock(&self.state)
            .responders
            .insert(mnemonic.to_string(), Responder::Indexed(values));
    }

    /// Reply to `mnemonic` with these status words in order; the last repeats.
    pub fn status_sequence<I: IntoIterator<Item = i64>>(&self, mnemonic: &str, words: I) {
        lock(&self.state).responders.insert(
            mnemonic.to_string(),
            Responder::Status(words.into_iter().collect()),
        );
    }

    /// Model an acquisition: after `trigger`, `status` reads 0 for `busy_polls`
    /// queries, then 1 exactly once. Every other read returns 0.
    pub fn acquisition(&self, trigger: &str, status: &str, busy_polls: usize) {
        lock(&self.state).acquisition = Some(Acquisition {
            trigger: trigger.to_string(),
            status: status.to_string(),
            busy_polls,
            remaining: 0,
            running: false,
        });
    }

    /// Send only `keep` payload bytes of the next block reply.
    pub fn truncate_next_block(&self, keep: usize) {
        lock(&self.state).truncate_next = Some(keep);
    }

    /// Deliver at most `size` bytes per read.
    pub fn set_chunk_size(&self, size: usize) {
        lock(&self.state).chunk_size = Some(size.max(1));
    }

    /// Echo every command line before its reply.
    pub fn set_echo(&self, echo: bool) {
        lock(&self.state).echo = echo;
    }

    /// Once the reply queue is empty, keep returning garbage on every read.
    pub fn set_noise(&self, noise: bool) {
        lock(&self.state).noise = noise;
    }

    /// Make every write fail with a broken pipe.
    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }

    /// Complete command lines received, in order, terminators stripped.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    /// Mnemonics received, in order.
    pub fn mnemonics(&self) -> Vec<String> {
        lock(&self.state)
            .log
            .iter()
            .map(|line| line.split(' ').next().unwrap_or_default().to_string())
            .collect()
    }

    /// How many lines started with `mnemonic`.
    pub fn count_of(&self, mnemonic: &str) -> usize {
        self.mnemonics().iter().filter(|m| *m == mnemonic).count()
    }

    /// Total bytes accepted by `write`.
    pub fn bytes_written(&self) -> usize {
        lock(&self.state).bytes_written
    }

    /// Bytes queued but not yet read.
    pub fn unread(&self) -> usize {
        lock(&self.state).outbound.len()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        let mut state = lock(&self.state);
        state.log.clear();
        state.bytes_written = 0;
    }
}

impl Transport for SimulatedInstrument {
    fn describe(&self) -> String {
        "simulated SR785".to_string()
    }

    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = lock(&self.state);
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }
        state.bytes_written += bytes.len();
        state.inbound.extend_from_slice(bytes);

        while let Some(pos) = state.inbound.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = state.inbound.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if !line.is_empty() {
                state.handle_line(&line);
            }
        }
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let mut state = lock(&self.state);
        let limit = state.chunk_size.unwrap_or(buf.len()).min(buf.len());

        if state.outbound.is_empty() {
            if state.noise {
                buf[..limit].fill(b'~');
                return Ok(limit);
            }
            return Ok(0);
        }

        let n = limit.min(state.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        lock(&self.state).outbound.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(sim: &mut SimulatedInstrument) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = sim.read(&mut buf, Duration::ZERO).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_settings_are_read_back() {
        let mut sim = SimulatedInstrument::new();
        sim.write(b"FSPN 2,102400\n").unwrap();
        sim.write(b"FSPN? 2\n").unwrap();
        assert_eq!(read_all(&mut sim), "102400\n");
    }

    #[test]
    fn test_lines_split_across_writes() {
        let mut sim = SimulatedInstrument::new();
        let handle = sim.handle();
        sim.write(b"*ID").unwrap();
        assert!(handle.commands().is_empty());
        sim.write(b"N?\n").unwrap();
        assert_eq!(handle.commands(), vec!["*IDN?"]);
        assert_eq!(read_all(&mut sim), format!("{SIM_IDENTITY}\n"));
    }

    #[test]
    fn test_completion_bit_latches_and_clears_on_read() {
        let mut sim = SimulatedInstrument::new();
        sim.handle().acquisition("STRT", "DSPS?", 2);

        sim.write(b"DSPS? 1\n").unwrap();
        assert_eq!(read_all(&mut sim), "0\n");

        sim.write(b"STRT\n").unwrap();
        sim.write(b"DSPS? 1\nDSPS? 1\nDSPS? 1\n").unwrap();
        assert_eq!(read_all(&mut sim), "0\n0\n1\n");

        sim.write(b"DSPS? 1\n").unwrap();
        assert_eq!(read_all(&mut sim), "0\n");
    }

    #[test]
    fn test_reply_keyed_by_first_argument() {
        let mut sim = SimulatedInstrument::sr785();
        sim.write(b"DSPY? 0,3\n").unwrap();
        assert_eq!(read_all(&mut sim), "-20.25\n");
        sim.write(b"DSPY? 1,3\n").unwrap();
        assert_eq!(read_all(&mut sim), "-90\n");
    }

    #[test]
    fn test_block_truncation() {
        let mut sim = SimulatedInstrument::new();
        let handle = sim.handle();
        handle.respond_block("DSPB?", vec![b'a'; 12]);
        handle.truncate_next_block(5);

        sim.write(b"DSPB? 0\n").unwrap();
        assert_eq!(read_all(&mut sim), "#212aaaaa");
        sim.write(b"DSPB? 0\n").unwrap();
        assert_eq!(read_all(&mut sim), "#212aaaaaaaaaaaa\n");
    }
}
