//! Windows waveOut playback.
//!
//! PCM is copied into pooled transfer buffers and queued on the device; the
//! driver's completion callback hands each buffer back to the pool. `write`
//! only blocks while every buffer is in flight, `close` blocks until the
//! pool has drained.

pub mod pool;
#[cfg(windows)]
mod winmm;

#[cfg(windows)]
pub use winmm::{WinMmDevice, WinMmDriver};

use self::pool::{BufferPool, TransferBuffer};
use crate::config::WaveOutConfig;
use crate::error::{OutputError, open_failed};
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::{ControlReply, ControlRequest, ModeCore, ModeFlags, OpenStatus, PlayMode};
use crate::negotiate::{SampleFormat, force_encoding, pick_format, settle};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const LABEL: &str = "waveOut";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub trait WaveOutDevice: Send {
    /// Queues a filled buffer. On failure the device has already returned
    /// the buffer to the pool.
    fn submit(&mut self, buffer: Box<TransferBuffer>) -> Result<(), OutputError>;

    /// Stops playback and marks every queued buffer done.
    fn reset(&mut self);
}

pub trait WaveOutDriver: Send + Sync {
    type Device: WaveOutDevice;

    fn device_count(&self) -> u32;

    /// Asks the driver whether it would open with this format.
    fn supports(&self, device_id: Option<u32>, sample: SampleFormat, channels: usize, rate: u32)
    -> bool;

    fn open(
        &self,
        device_id: Option<u32>,
        format: &PlaybackFormat,
        pool: Arc<BufferPool>,
    ) -> Result<Self::Device, OutputError>;
}

struct Session<D> {
    device: D,
    pool: Arc<BufferPool>,
    requested: PlaybackFormat,
    /// Leading bytes of a frame split across `write` calls.
    carry: Vec<u8>,
}

pub struct WaveOutMode<D: WaveOutDriver> {
    core: ModeCore,
    config: WaveOutConfig,
    driver: D,
    session: Option<Session<D::Device>>,
}

impl<D: WaveOutDriver> WaveOutMode<D> {
    pub fn new(driver: D, config: WaveOutConfig) -> Self {
        Self {
            core: ModeCore::new('d', "Windows audio driver", ModeFlags::PCM_STREAM),
            config,
            driver,
            session: None,
        }
    }

    pub fn pool(&self) -> Option<&Arc<BufferPool>> {
        self.session.as_ref().map(|s| &s.pool)
    }

    fn backoff(&self) -> Duration {
        Duration::from_millis(self.config.sleep_ms.max(1))
    }

    fn device_label(&self) -> String {
        self.config
            .device_id
            .map_or_else(|| "wave mapper".to_string(), |id| format!("device {id}"))
    }

    fn open_with(&mut self, requested: PlaybackFormat) -> Result<OpenStatus, OutputError> {
        let mut wanted = requested;
        // waveOut has no companded or 24-bit PCM; 8-bit is unsigned.
        let mut status = force_encoding(
            LABEL,
            &mut wanted,
            Encoding::empty(),
            Encoding::ULAW | Encoding::ALAW | Encoding::BITS24,
        );

        let device_id = self.config.device_id;
        let channels_tried: &[usize] = if wanted.channels() == 1 { &[1, 2] } else { &[2, 1] };
        let mut chosen = None;
        for &channels in channels_tried {
            let probe = pick_format(LABEL, wanted.encoding, |sample| {
                self.driver.supports(device_id, sample, channels, wanted.rate)
            });
            if let Ok(sample) = probe {
                chosen = Some((sample, channels));
                break;
            }
        }
        let Some((sample, channels)) = chosen else {
            return Err(OutputError::Format(format!(
                "{LABEL} {} accepts no {} at {} Hz",
                self.device_label(),
                wanted.encoding.describe(),
                wanted.rate
            )));
        };
        let (format, settled) = settle(LABEL, &wanted, sample, channels, wanted.rate)?;
        if settled == OpenStatus::Adjusted {
            status = OpenStatus::Adjusted;
        }

        // Every queued buffer must end on a frame boundary.
        let frame = format.frame_bytes().max(1);
        let buffer_bytes = (self.config.buffer_bytes / frame).max(1) * frame;
        if buffer_bytes != self.config.buffer_bytes {
            debug!(
                "{LABEL}: buffer size {} rounded to {buffer_bytes} for {frame}-byte frames",
                self.config.buffer_bytes
            );
        }
        let pool = BufferPool::new(self.config.buffers, buffer_bytes);
        let device = self
            .driver
            .open(device_id, &format, pool.clone())
            .map_err(|e| {
                let message = open_failed(LABEL, &self.device_label(), e);
                error!("{message}");
                OutputError::Device(message)
            })?;
        debug!(
            "{LABEL}: {} at {} Hz, {} buffers of {} bytes",
            format.encoding.describe(),
            format.rate,
            pool.total(),
            pool.buffer_bytes()
        );
        self.core.format = format;
        self.session = Some(Session {
            device,
            pool,
            requested,
            carry: Vec::with_capacity(frame),
        });
        Ok(status)
    }

    fn shutdown(&mut self, discard: bool) -> Option<PlaybackFormat> {
        let mut session = self.session.take()?;
        if discard {
            session.device.reset();
        }
        if !session.pool.wait_idle(self.backoff(), DRAIN_TIMEOUT) {
            warn!(
                "{LABEL}: {} buffers still queued after {:?}, resetting",
                session.pool.in_use(),
                DRAIN_TIMEOUT
            );
            session.device.reset();
        }
        Some(session.requested)
    }

    /// Close and reopen with the originally requested format.
    fn reopen(&mut self, discard: bool) -> Result<ControlReply, OutputError> {
        let Some(requested) = self.shutdown(discard) else {
            return Ok(ControlReply::Done);
        };
        self.open_with(requested)?;
        Ok(ControlReply::Done)
    }
}

impl<D: WaveOutDriver> PlayMode for WaveOutMode<D> {
    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn open(&mut self) -> Result<OpenStatus, OutputError> {
        self.close();
        self.open_with(self.core.format)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
        let backoff = self.backoff();
        let frame = self.core.format.frame_bytes().max(1);
        let session = self.session.as_mut().ok_or(OutputError::NotOpen)?;
        let buffer_bytes = session.pool.buffer_bytes();
        let mut rest = buf;

        if !session.carry.is_empty() {
            let room = buffer_bytes - session.carry.len();
            let joined = (session.carry.len() + rest.len().min(room)) / frame * frame;
            if joined == 0 {
                session.carry.extend_from_slice(rest);
                return Ok(buf.len());
            }
            let take = joined - session.carry.len();
            session.carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            let mut buffer = session.pool.acquire(backoff);
            buffer.fill(&session.carry);
            session.carry.clear();
            session.device.submit(buffer)?;
        }

        let whole = rest.len() / frame * frame;
        for chunk in rest[..whole].chunks(buffer_bytes) {
            let mut buffer = session.pool.acquire(backoff);
            buffer.fill(chunk);
            session.device.submit(buffer)?;
        }
        session.carry.extend_from_slice(&rest[whole..]);
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.shutdown(false);
    }

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError> {
        let frame = self.core.format.frame_bytes().max(1);
        match request {
            ControlRequest::Discard => self.reopen(true),
            ControlRequest::Flush => self.reopen(false),
            ControlRequest::PlayStart(_) | ControlRequest::PlayEnd => Ok(ControlReply::Done),
            ControlRequest::GetFragSize => {
                let pool = self.pool().ok_or(OutputError::NotOpen)?;
                Ok(ControlReply::Bytes(pool.buffer_bytes()))
            }
            ControlRequest::GetQSize => {
                let pool = self.pool().ok_or(OutputError::NotOpen)?;
                Ok(ControlReply::Bytes(pool.total() * pool.buffer_bytes()))
            }
            ControlRequest::GetFillable => {
                let pool = self.pool().ok_or(OutputError::NotOpen)?;
                let bytes = pool.free_len() * pool.buffer_bytes();
                Ok(ControlReply::Frames((bytes / frame) as u64))
            }
            ControlRequest::GetFilled => {
                let pool = self.pool().ok_or(OutputError::NotOpen)?;
                let bytes = pool.in_use() * pool.buffer_bytes();
                Ok(ControlReply::Frames((bytes / frame) as u64))
            }
            _ => Err(OutputError::Unsupported),
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn detect(&self) -> bool {
        self.driver.device_count() > 0
    }
}
