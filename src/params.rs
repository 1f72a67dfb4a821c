//! Typed parameters for streaming sessions and composition of the external
//! streamer invocation.
//!
//! Parameter structs carry realistic defaults and a `validate()` step; the
//! fields map one-to-one onto the flag grammar the streamer binary accepts.
//! Tests inject a complete [`StreamerInvocation`] instead of composing one,
//! which keeps the supervisor path identical with mock and real peers.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StreamError};

/// Default sample rate: 40 MHz.
pub const DEFAULT_SAMPLE_RATE: u64 = 40_000_000;

/// Default centre frequency: 5 GHz.
pub const DEFAULT_FREQUENCY: u64 = 5_000_000_000;

/// AGC operating mode of the radio front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgcMode {
    #[default]
    Manual,
    FastAttack,
    SlowAttack,
    Hybrid,
}

impl AgcMode {
    /// The token the streamer binary accepts for `-agc_mode`.
    pub fn token(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::FastAttack => "fast_attack",
            Self::SlowAttack => "slow_attack",
            Self::Hybrid => "hybrid",
        }
    }
}

/// A fully composed external-process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl StreamerInvocation {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

/// Parameters for a receive session.
///
/// All fields have working defaults; `start_rx` validates them before
/// touching the filesystem.
#[derive(Debug, Clone)]
pub struct RxParams {
    /// Sample rate in hertz.
    pub sample_rate: u64,
    /// RX centre frequency in hertz.
    pub frequency: u64,
    /// RX gain in dB (attenuation permitted).
    pub gain: i32,
    pub agc_mode: AgcMode,
    /// Analog bandwidth in hertz; `None` means "same as sample rate".
    pub bandwidth: Option<u64>,
    /// Ring depth the streamer should provision, in seconds of samples.
    pub buffer_time: f64,
    /// Stop after this many samples; 0 means unbounded.
    pub sample_cap: u64,
    /// Ring file path; the streamer creates it, the host deletes stale ones.
    pub ring_path: PathBuf,
    pub device_index: u32,
    /// Bound of the chunk channel; also sizes the chunk pool.
    pub chunk_capacity: usize,
    /// Bound of the warnings channel.
    pub warning_capacity: usize,
    pub quiet: bool,
    /// Directory for the streamer log file; `None` means the system temp dir.
    pub log_dir: Option<PathBuf>,
    /// Streamer binary; resolved through `PATH` unless absolute.
    pub program: PathBuf,
    /// Full invocation override for tests; skips composition entirely.
    pub invocation_override: Option<StreamerInvocation>,
}

impl Default for RxParams {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frequency: DEFAULT_FREQUENCY,
            gain: 20,
            agc_mode: AgcMode::Manual,
            bandwidth: None,
            buffer_time: 3.0,
            sample_cap: 0,
            ring_path: PathBuf::from("/dev/shm/iqbridge-rx.ring"),
            device_index: 0,
            chunk_capacity: 100,
            warning_capacity: 16,
            quiet: false,
            log_dir: None,
            program: PathBuf::from("iq_streamer"),
            invocation_override: None,
        }
    }
}

impl RxParams {
    pub fn with_ring_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ring_path = path.into();
        self
    }

    pub fn with_invocation(mut self, invocation: StreamerInvocation) -> Self {
        self.invocation_override = Some(invocation);
        self
    }

    pub fn with_chunk_capacity(mut self, capacity: usize) -> Self {
        self.chunk_capacity = capacity;
        self
    }

    pub fn validate(&self, channels: u16) -> Result<()> {
        if !(1..=2).contains(&channels) {
            return Err(StreamError::invalid_config(format!(
                "channels must be 1 or 2, got {channels}"
            )));
        }
        if self.sample_rate == 0 {
            return Err(StreamError::invalid_config("sample_rate must be nonzero"));
        }
        if self.buffer_time <= 0.0 {
            return Err(StreamError::invalid_config("buffer_time must be positive"));
        }
        if self.chunk_capacity == 0 || self.warning_capacity == 0 {
            return Err(StreamError::invalid_config(
                "channel capacities must be nonzero",
            ));
        }
        Ok(())
    }

    pub(crate) fn bandwidth_hz(&self) -> u64 {
        self.bandwidth.unwrap_or(self.sample_rate)
    }
}

/// Parameters for a transmit session.
#[derive(Debug, Clone)]
pub struct TxParams {
    pub sample_rate: u64,
    /// TX centre frequency in hertz.
    pub frequency: u64,
    /// TX gain in dB; negative values are attenuation.
    pub gain: i32,
    pub bandwidth: Option<u64>,
    pub buffer_time: f64,
    /// TX channel count; must match the shape of the input blocks.
    pub channels: u16,
    /// Samples per ring slot per channel. The host creates the TX ring, so
    /// the geometry lives here rather than with the streamer.
    pub chunk_size: u32,
    /// Slot count override; `None` derives it from `buffer_time`.
    pub num_slots: Option<u32>,
    pub ring_path: PathBuf,
    pub device_index: u32,
    pub quiet: bool,
    pub warning_capacity: usize,
    /// Bound of the stats channel.
    pub stats_capacity: usize,
    /// Pause after `writer_done` so the peer can flush buffered slots.
    pub drain_grace: Duration,
    pub log_dir: Option<PathBuf>,
    pub program: PathBuf,
    pub invocation_override: Option<StreamerInvocation>,
}

impl Default for TxParams {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frequency: DEFAULT_FREQUENCY,
            gain: -10,
            bandwidth: None,
            buffer_time: 3.0,
            channels: 1,
            chunk_size: 65_536,
            num_slots: None,
            ring_path: PathBuf::from("/dev/shm/iqbridge-tx.ring"),
            device_index: 0,
            quiet: false,
            warning_capacity: 16,
            stats_capacity: 1000,
            drain_grace: Duration::from_millis(500),
            log_dir: None,
            program: PathBuf::from("iq_streamer"),
            invocation_override: None,
        }
    }
}

impl TxParams {
    pub fn with_ring_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ring_path = path.into();
        self
    }

    pub fn with_invocation(mut self, invocation: StreamerInvocation) -> Self {
        self.invocation_override = Some(invocation);
        self
    }

    pub fn with_geometry(mut self, chunk_size: u32, num_slots: u32) -> Self {
        self.chunk_size = chunk_size;
        self.num_slots = Some(num_slots);
        self
    }

    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=2).contains(&self.channels) {
            return Err(StreamError::invalid_config(format!(
                "channels must be 1 or 2, got {}",
                self.channels
            )));
        }
        if self.sample_rate == 0 {
            return Err(StreamError::invalid_config("sample_rate must be nonzero"));
        }
        if self.chunk_size == 0 {
            return Err(StreamError::invalid_config("chunk_size must be nonzero"));
        }
        if self.buffer_time <= 0.0 {
            return Err(StreamError::invalid_config("buffer_time must be positive"));
        }
        if self.warning_capacity == 0 || self.stats_capacity == 0 {
            return Err(StreamError::invalid_config(
                "channel capacities must be nonzero",
            ));
        }
        Ok(())
    }

    pub(crate) fn bandwidth_hz(&self) -> u64 {
        self.bandwidth.unwrap_or(self.sample_rate)
    }

    /// Slot count: explicit override, or enough slots for `buffer_time`
    /// seconds of samples, clamped to a sane range.
    pub(crate) fn effective_num_slots(&self) -> u32 {
        if let Some(n) = self.num_slots {
            return n.max(2);
        }
        let derived = (self.buffer_time * self.sample_rate as f64 / self.chunk_size as f64)
            .round() as u32;
        derived.clamp(2, 4096)
    }
}

/// Parameters for a full-duplex session: one streamer process, two rings.
///
/// The shared radio settings (`sample_rate`, `device_index`) must agree
/// between the RX and TX halves; `agc_mode` and `bandwidth` are taken from
/// the RX half, matching the single flags the streamer accepts.
#[derive(Debug, Clone, Default)]
pub struct DuplexParams {
    pub rx: RxParams,
    pub tx: TxParams,
    /// Full invocation override for tests; skips composition entirely.
    pub invocation_override: Option<StreamerInvocation>,
}

impl DuplexParams {
    pub fn with_invocation(mut self, invocation: StreamerInvocation) -> Self {
        self.invocation_override = Some(invocation);
        self
    }

    pub fn validate(&self, channels: u16) -> Result<()> {
        self.rx.validate(channels)?;
        self.tx.validate()?;
        if self.tx.channels != channels {
            return Err(StreamError::invalid_config(format!(
                "duplex channel count {channels} does not match tx.channels {}",
                self.tx.channels
            )));
        }
        if self.rx.sample_rate != self.tx.sample_rate {
            return Err(StreamError::invalid_config(
                "rx and tx sample rates must agree in duplex",
            ));
        }
        if self.rx.device_index != self.tx.device_index {
            return Err(StreamError::invalid_config(
                "rx and tx device indices must agree in duplex",
            ));
        }
        if self.rx.ring_path == self.tx.ring_path {
            return Err(StreamError::invalid_config(
                "rx and tx ring paths must differ",
            ));
        }
        Ok(())
    }
}

/// Compose the streamer invocation for a receive session.
pub fn rx_invocation(channels: u16, p: &RxParams) -> StreamerInvocation {
    let mut args = vec![
        "-c".to_string(),
        p.device_index.to_string(),
        "-samplerate".to_string(),
        p.sample_rate.to_string(),
        "-rx_freq".to_string(),
        p.frequency.to_string(),
        "-rx_gain".to_string(),
        p.gain.to_string(),
        "-agc_mode".to_string(),
        p.agc_mode.token().to_string(),
        "-bandwidth".to_string(),
        p.bandwidth_hz().to_string(),
        "-channels".to_string(),
        channels.to_string(),
        "-shm_path".to_string(),
        p.ring_path.display().to_string(),
        "-buffer_time".to_string(),
        p.buffer_time.to_string(),
        "-num_samples".to_string(),
        p.sample_cap.to_string(),
    ];
    if p.quiet {
        args.push("-q".to_string());
    }
    StreamerInvocation::new(p.program.clone(), args)
}

/// Compose the streamer invocation for a transmit session.
pub fn tx_invocation(p: &TxParams) -> StreamerInvocation {
    let mut args = vec![
        "-c".to_string(),
        p.device_index.to_string(),
        "-samplerate".to_string(),
        p.sample_rate.to_string(),
        "-tx_freq".to_string(),
        p.frequency.to_string(),
        "-tx_gain".to_string(),
        p.gain.to_string(),
        "-bandwidth".to_string(),
        p.bandwidth_hz().to_string(),
        "-channels".to_string(),
        p.channels.to_string(),
        "-shm_path".to_string(),
        p.ring_path.display().to_string(),
        "-buffer_time".to_string(),
        p.buffer_time.to_string(),
    ];
    if p.quiet {
        args.push("-q".to_string());
    }
    StreamerInvocation::new(p.program.clone(), args)
}

/// Compose the streamer invocation for a full-duplex session.
///
/// The streamer is told to wait for the host-created TX ring (`-w`) while it
/// creates the RX ring itself.
pub fn duplex_invocation(channels: u16, p: &DuplexParams) -> StreamerInvocation {
    let mut args = vec![
        "-c".to_string(),
        p.rx.device_index.to_string(),
        "-samplerate".to_string(),
        p.rx.sample_rate.to_string(),
        "-rx_freq".to_string(),
        p.rx.frequency.to_string(),
        "-tx_freq".to_string(),
        p.tx.frequency.to_string(),
        "-rx_gain".to_string(),
        p.rx.gain.to_string(),
        "-tx_gain".to_string(),
        p.tx.gain.to_string(),
        "-agc_mode".to_string(),
        p.rx.agc_mode.token().to_string(),
        "-bandwidth".to_string(),
        p.rx.bandwidth_hz().to_string(),
        "-channels".to_string(),
        channels.to_string(),
        "-rx_shm_path".to_string(),
        p.rx.ring_path.display().to_string(),
        "-tx_shm_path".to_string(),
        p.tx.ring_path.display().to_string(),
        "-rx_buffer_time".to_string(),
        p.rx.buffer_time.to_string(),
        "-tx_buffer_time".to_string(),
        p.tx.buffer_time.to_string(),
        "-num_samples".to_string(),
        p.rx.sample_cap.to_string(),
    ];
    if p.rx.quiet {
        args.push("-q".to_string());
    }
    args.push("-w".to_string());
    StreamerInvocation::new(p.rx.program.clone(), args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agc_tokens() {
        assert_eq!(AgcMode::Manual.token(), "manual");
        assert_eq!(AgcMode::FastAttack.token(), "fast_attack");
        assert_eq!(AgcMode::SlowAttack.token(), "slow_attack");
        assert_eq!(AgcMode::Hybrid.token(), "hybrid");
    }

    #[test]
    fn test_rx_defaults() {
        let p = RxParams::default();
        assert_eq!(p.sample_rate, 40_000_000);
        assert_eq!(p.frequency, 5_000_000_000);
        assert_eq!(p.gain, 20);
        assert_eq!(p.buffer_time, 3.0);
        assert_eq!(p.chunk_capacity, 100);
        assert_eq!(p.warning_capacity, 16);
        assert_eq!(p.bandwidth_hz(), p.sample_rate);
        p.validate(1).unwrap();
        p.validate(2).unwrap();
        assert!(p.validate(0).is_err());
        assert!(p.validate(3).is_err());
    }

    #[test]
    fn test_rx_invocation_args() {
        let p = RxParams {
            ring_path: PathBuf::from("/dev/shm/r.ring"),
            quiet: true,
            ..RxParams::default()
        };
        let inv = rx_invocation(2, &p);
        assert_eq!(inv.program, PathBuf::from("iq_streamer"));
        let expected: Vec<String> = [
            "-c", "0", "-samplerate", "40000000", "-rx_freq", "5000000000", "-rx_gain", "20",
            "-agc_mode", "manual", "-bandwidth", "40000000", "-channels", "2", "-shm_path",
            "/dev/shm/r.ring", "-buffer_time", "3", "-num_samples", "0", "-q",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(inv.args, expected);
    }

    #[test]
    fn test_tx_invocation_args() {
        let p = TxParams {
            ring_path: PathBuf::from("/dev/shm/t.ring"),
            buffer_time: 0.5,
            ..TxParams::default()
        };
        let inv = tx_invocation(&p);
        let expected: Vec<String> = [
            "-c", "0", "-samplerate", "40000000", "-tx_freq", "5000000000", "-tx_gain", "-10",
            "-bandwidth", "40000000", "-channels", "1", "-shm_path", "/dev/shm/t.ring",
            "-buffer_time", "0.5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(inv.args, expected);
    }

    #[test]
    fn test_duplex_invocation_selects_both_rings() {
        let p = DuplexParams::default();
        let inv = duplex_invocation(1, &p);
        let args = inv.args.join(" ");
        assert!(args.contains("-rx_shm_path /dev/shm/iqbridge-rx.ring"));
        assert!(args.contains("-tx_shm_path /dev/shm/iqbridge-tx.ring"));
        assert!(args.contains("-rx_buffer_time 3"));
        assert!(args.contains("-tx_buffer_time 3"));
        assert_eq!(inv.args.last().unwrap(), "-w");
    }

    #[test]
    fn test_duplex_validation_catches_disagreements() {
        let mut p = DuplexParams::default();
        p.validate(1).unwrap();

        p.tx.sample_rate = 1_000_000;
        assert!(p.validate(1).is_err());
        p.tx.sample_rate = p.rx.sample_rate;

        p.tx.ring_path = p.rx.ring_path.clone();
        assert!(p.validate(1).is_err());
    }

    #[test]
    fn test_tx_slot_derivation() {
        let p = TxParams {
            sample_rate: 1_000_000,
            chunk_size: 1000,
            buffer_time: 0.016,
            ..TxParams::default()
        };
        assert_eq!(p.effective_num_slots(), 16);

        let capped = TxParams {
            buffer_time: 1e6,
            ..p.clone()
        };
        assert_eq!(capped.effective_num_slots(), 4096);

        let explicit = TxParams {
            num_slots: Some(1),
            ..p
        };
        assert_eq!(explicit.effective_num_slots(), 2);
    }
}
