//! ALSA playback.
//!
//! The mode drives a [`PcmDevice`]: negotiate, prepare, then write frames,
//! recovering from underruns and waiting out a full device buffer. The
//! real device lives in `pcm.rs` behind the `alsa` feature.

#[cfg(all(feature = "alsa", target_os = "linux"))]
mod pcm;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use pcm::{AlsaDriver, AlsaPcm};

use crate::config::{ALSA_DEBUG_ENV, AlsaConfig, env_flag};
use crate::error::{OutputError, op_failed, open_failed};
use crate::format::Encoding;
use crate::mode::{ControlReply, ControlRequest, ModeCore, ModeFlags, OpenStatus, PlayMode};
use crate::negotiate::{SampleFormat, settle};
use tracing::{debug, error, trace};

const LABEL: &str = "ALSA";
const DEFAULT_FRAGMENT_LOG2: i32 = 12;
const DEFAULT_PERIODS: usize = 4;
/// Write attempts without progress before giving up.
const MAX_STALLS: u32 = 16;

/// What the mode asks of the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwRequest {
    pub encoding: Encoding,
    pub channels: usize,
    pub rate: u32,
    pub period_frames: usize,
    pub periods: usize,
}

/// What the hardware granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwConfig {
    pub sample: SampleFormat,
    pub channels: usize,
    pub rate: u32,
    pub period_frames: usize,
    pub buffer_frames: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    /// Buffer ran dry (EPIPE); the stream must be prepared again.
    Underrun,
    /// No room right now (EAGAIN).
    WouldBlock,
    /// Interrupted system call (EINTR).
    Interrupted,
    /// Device suspended (ESTRPIPE).
    Suspended,
    Other(String),
}

pub trait PcmDevice: Send {
    /// Selects the sample format from the negotiator's candidates and
    /// installs channel count, rate and buffer geometry.
    fn configure(&mut self, request: &HwRequest) -> Result<HwConfig, OutputError>;

    /// Writes whole interleaved frames, returning how many were taken.
    fn write_frames(&mut self, data: &[u8]) -> Result<usize, PcmError>;

    fn prepare(&mut self) -> Result<(), String>;

    fn resume(&mut self) -> Result<(), String>;

    /// Stops immediately, dropping queued frames.
    fn drop_pending(&mut self) -> Result<(), String>;

    /// Blocks until queued frames have played.
    fn drain(&mut self) -> Result<(), String>;

    /// Waits up to `timeout_ms` for room; `false` on timeout.
    fn wait(&mut self, timeout_ms: u32) -> Result<bool, String>;

    fn avail(&mut self) -> Result<usize, String>;

    /// Frames queued ahead of the one being heard.
    fn delay(&mut self) -> Result<i64, String>;
}

pub trait PcmDriver: Send + Sync {
    type Device: PcmDevice;

    fn open(&self, name: &str) -> Result<Self::Device, String>;
}

struct Session<D> {
    device: D,
    hw: HwConfig,
    /// Frames accepted since the last reset.
    written: u64,
    /// Bytes of an incomplete trailing frame.
    carry: Vec<u8>,
}

pub struct AlsaMode<P: PcmDriver> {
    core: ModeCore,
    config: AlsaConfig,
    driver: P,
    session: Option<Session<P::Device>>,
    trace_writes: bool,
}

impl<P: PcmDriver> AlsaMode<P> {
    pub fn new(driver: P, config: AlsaConfig) -> Self {
        Self {
            core: ModeCore::new(
                's',
                "ALSA pcm device",
                ModeFlags::PCM_STREAM | ModeFlags::CAN_TRACE | ModeFlags::BUFF_FRAGM_OPT,
            ),
            config,
            driver,
            session: None,
            trace_writes: env_flag(ALSA_DEBUG_ENV),
        }
    }

    pub fn hw_config(&self) -> Option<HwConfig> {
        self.session.as_ref().map(|s| s.hw)
    }

    /// Fragment size in bytes and fragment count from `extra_param`
    /// (fragment count, log2 of the fragment size in bytes).
    fn fragments(&self) -> (usize, usize) {
        let format = &self.core.format;
        let log2 = match format.extra_param[1] {
            n if n > 0 => n.clamp(4, 24),
            _ => DEFAULT_FRAGMENT_LOG2,
        };
        let periods = match format.extra_param[0] {
            n if n > 0 => n as usize,
            _ => self.config.periods.map_or(DEFAULT_PERIODS, |p| p as usize),
        };
        (1_usize << log2, periods.max(2))
    }

    /// Period length in frames of `frame_bytes`; an explicit
    /// `period_frames` setting wins over the fragment size.
    fn period_frames(&self, fragment_bytes: usize, frame_bytes: usize) -> usize {
        self.config
            .period_frames
            .map(|f| f as usize)
            .unwrap_or((fragment_bytes / frame_bytes.max(1)).max(1))
    }

    fn rw_error(op: &str, err: impl std::fmt::Display) -> OutputError {
        let message = op_failed(LABEL, op, err);
        error!("{message}");
        OutputError::Device(message)
    }

    fn reset_counters(session: &mut Session<P::Device>) {
        session.written = 0;
        session.carry.clear();
    }
}

impl<P: PcmDriver> PlayMode for AlsaMode<P> {
    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn open(&mut self) -> Result<OpenStatus, OutputError> {
        self.close();
        let requested = self.core.format;
        let (fragment_bytes, periods) = self.fragments();
        let mut device = self.driver.open(&self.config.device).map_err(|e| {
            let message = open_failed(LABEL, &format!("'{}'", self.config.device), e);
            error!("{message}");
            OutputError::Device(message)
        })?;

        let asked_frames = self.period_frames(fragment_bytes, requested.frame_bytes());
        let mut hw = device.configure(&HwRequest {
            encoding: requested.encoding,
            channels: requested.channels(),
            rate: requested.rate,
            period_frames: asked_frames,
            periods,
        })?;
        let (format, status) = settle(LABEL, &requested, hw.sample, hw.channels, hw.rate)?;
        // Fragment sizes are in bytes of the format actually played.
        let period_frames = self.period_frames(fragment_bytes, format.frame_bytes());
        if period_frames != asked_frames {
            debug!("ALSA: {fragment_bytes}-byte fragments are {period_frames} frames after negotiation");
            hw = device.configure(&HwRequest {
                encoding: format.encoding,
                channels: format.channels(),
                rate: format.rate,
                period_frames,
                periods,
            })?;
        }
        device.prepare().map_err(|e| Self::rw_error("prepare", e))?;
        debug!(
            "ALSA {}: {} at {} Hz, period {} frames, buffer {} frames",
            self.config.device,
            format.encoding.describe(),
            format.rate,
            hw.period_frames,
            hw.buffer_frames
        );
        self.core.format = format;
        self.session = Some(Session {
            device,
            hw,
            written: 0,
            carry: Vec::new(),
        });
        Ok(status)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
        let frame = self.core.format.frame_bytes().max(1);
        let wait_ms = self.config.wait_ms;
        let trace_writes = self.trace_writes;
        let session = self.session.as_mut().ok_or(OutputError::NotOpen)?;

        let joined;
        let data: &[u8] = if session.carry.is_empty() {
            buf
        } else {
            let mut pending = std::mem::take(&mut session.carry);
            pending.extend_from_slice(buf);
            joined = pending;
            &joined
        };
        let whole = data.len() / frame * frame;
        session.carry.extend_from_slice(&data[whole..]);

        let mut offset = 0;
        let mut stalls = 0;
        while offset < whole {
            match session.device.write_frames(&data[offset..whole]) {
                Ok(0) => {
                    stalls += 1;
                    if stalls > MAX_STALLS {
                        return Err(Self::rw_error("write", "device accepts no frames"));
                    }
                    session
                        .device
                        .wait(wait_ms)
                        .map_err(|e| Self::rw_error("wait", e))?;
                }
                Ok(frames) => {
                    stalls = 0;
                    offset += frames * frame;
                    session.written += frames as u64;
                    if trace_writes {
                        trace!("ALSA wrote {frames} frames ({} total)", session.written);
                    }
                }
                Err(PcmError::Interrupted) => continue,
                Err(PcmError::WouldBlock) => {
                    session
                        .device
                        .wait(wait_ms)
                        .map_err(|e| Self::rw_error("wait", e))?;
                }
                Err(PcmError::Underrun) => {
                    debug!("ALSA underrun, preparing the stream again");
                    session
                        .device
                        .prepare()
                        .map_err(|e| Self::rw_error("prepare", e))?;
                }
                Err(PcmError::Suspended) => {
                    debug!("ALSA device suspended, resuming");
                    if session.device.resume().is_err() {
                        session
                            .device
                            .prepare()
                            .map_err(|e| Self::rw_error("prepare", e))?;
                    }
                }
                Err(PcmError::Other(e)) => return Err(Self::rw_error("write", e)),
            }
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.device.drain() {
                debug!("ALSA drain on close failed: {e}");
            }
        }
    }

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError> {
        let frame = self.core.format.frame_bytes().max(1);
        let session = match (&request, self.session.as_mut()) {
            (ControlRequest::PlayStart(_) | ControlRequest::PlayEnd, _) => {
                return Ok(ControlReply::Done);
            }
            (ControlRequest::Midi(_), _) => return Err(OutputError::Unsupported),
            (_, Some(session)) => session,
            (_, None) => return Err(OutputError::NotOpen),
        };
        match request {
            ControlRequest::Discard => {
                session
                    .device
                    .drop_pending()
                    .map_err(|e| Self::rw_error("drop", e))?;
                session
                    .device
                    .prepare()
                    .map_err(|e| Self::rw_error("prepare", e))?;
                Self::reset_counters(session);
                Ok(ControlReply::Done)
            }
            ControlRequest::Flush => {
                session
                    .device
                    .drain()
                    .map_err(|e| Self::rw_error("drain", e))?;
                session
                    .device
                    .prepare()
                    .map_err(|e| Self::rw_error("prepare", e))?;
                Self::reset_counters(session);
                Ok(ControlReply::Done)
            }
            ControlRequest::GetFragSize => Ok(ControlReply::Bytes(session.hw.period_frames * frame)),
            ControlRequest::GetQSize => Ok(ControlReply::Bytes(session.hw.buffer_frames * frame)),
            ControlRequest::GetFillable => {
                let avail = session.device.avail().map_err(|e| Self::rw_error("avail", e))?;
                Ok(ControlReply::Frames(avail as u64))
            }
            ControlRequest::GetFilled => {
                let delay = session.device.delay().map_err(|e| Self::rw_error("delay", e))?;
                Ok(ControlReply::Frames(delay.max(0) as u64))
            }
            ControlRequest::GetSamples => {
                let delay = session.device.delay().map_err(|e| Self::rw_error("delay", e))?;
                let played = session.written.saturating_sub(delay.max(0) as u64);
                Ok(ControlReply::Frames(played))
            }
            _ => Err(OutputError::Unsupported),
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn detect(&self) -> bool {
        self.driver.open(&self.config.device).is_ok()
    }
}
