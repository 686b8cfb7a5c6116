use super::{HwConfig, HwRequest, PcmDevice, PcmDriver, PcmError};
use crate::error::OutputError;
use crate::negotiate::{SampleFormat, pick_format};
use alsa::pcm::{Access, Format, HwParams, PCM, State};
use alsa::{Direction, ValueOr};
use nix::libc;

/// Opens playback PCMs by ALSA name (`default`, `hw:0,0`, ...).
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaDriver;

impl PcmDriver for AlsaDriver {
    type Device = AlsaPcm;

    fn open(&self, name: &str) -> Result<AlsaPcm, String> {
        let pcm = PCM::new(name, Direction::Playback, false).map_err(|e| e.to_string())?;
        Ok(AlsaPcm { pcm })
    }
}

pub struct AlsaPcm {
    pcm: PCM,
}

// The handle is owned by a single mode and never used from two threads at once.
unsafe impl Send for AlsaPcm {}

fn alsa_format(sample: SampleFormat) -> Format {
    match sample {
        SampleFormat::S8 => Format::S8,
        SampleFormat::U8 => Format::U8,
        SampleFormat::S16Le => Format::S16LE,
        SampleFormat::S16Be => Format::S16BE,
        SampleFormat::U16Le => Format::U16LE,
        SampleFormat::U16Be => Format::U16BE,
        SampleFormat::S24Le => Format::S243LE,
        SampleFormat::S24Be => Format::S243BE,
        SampleFormat::U24Le => Format::U243LE,
        SampleFormat::U24Be => Format::U243BE,
        SampleFormat::MuLaw => Format::MuLaw,
        SampleFormat::ALaw => Format::ALaw,
    }
}

impl AlsaPcm {
    fn classify(&self, err: alsa::Error) -> PcmError {
        match self.pcm.state() {
            State::XRun => return PcmError::Underrun,
            State::Suspended => return PcmError::Suspended,
            _ => {}
        }
        match err.errno() {
            libc::EPIPE => PcmError::Underrun,
            libc::EAGAIN => PcmError::WouldBlock,
            libc::EINTR => PcmError::Interrupted,
            libc::ESTRPIPE => PcmError::Suspended,
            _ => PcmError::Other(err.to_string()),
        }
    }
}

impl PcmDevice for AlsaPcm {
    fn configure(&mut self, request: &HwRequest) -> Result<HwConfig, OutputError> {
        let hw_err = |what: &str, e: alsa::Error| OutputError::Device(format!("ALSA {what}: {e}"));
        let hwp = HwParams::any(&self.pcm).map_err(|e| hw_err("hw params", e))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(|e| hw_err("access", e))?;
        let sample = pick_format("ALSA", request.encoding, |fmt| {
            hwp.test_format(alsa_format(fmt)).is_ok()
        })?;
        hwp.set_format(alsa_format(sample))
            .map_err(|e| hw_err("format", e))?;
        let channels = hwp
            .set_channels_near(request.channels as u32)
            .map_err(|e| hw_err("channels", e))?;
        let rate = hwp
            .set_rate_near(request.rate, ValueOr::Nearest)
            .map_err(|e| hw_err("rate", e))?;
        let period = hwp
            .set_period_size_near(request.period_frames as alsa::pcm::Frames, ValueOr::Nearest)
            .map_err(|e| hw_err("period size", e))?;
        let buffer = hwp
            .set_buffer_size_near(period * request.periods as alsa::pcm::Frames)
            .map_err(|e| hw_err("buffer size", e))?;
        self.pcm.hw_params(&hwp).map_err(|e| hw_err("install", e))?;

        Ok(HwConfig {
            sample,
            channels: channels as usize,
            rate,
            period_frames: period.max(1) as usize,
            buffer_frames: buffer.max(1) as usize,
        })
    }

    fn write_frames(&mut self, data: &[u8]) -> Result<usize, PcmError> {
        let io = self.pcm.io_bytes();
        match io.writei(data) {
            Ok(frames) => Ok(frames),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn prepare(&mut self) -> Result<(), String> {
        self.pcm.prepare().map_err(|e| e.to_string())
    }

    fn resume(&mut self) -> Result<(), String> {
        self.pcm.resume().map_err(|e| e.to_string())
    }

    fn drop_pending(&mut self) -> Result<(), String> {
        self.pcm.drop().map_err(|e| e.to_string())
    }

    fn drain(&mut self) -> Result<(), String> {
        self.pcm.drain().map_err(|e| e.to_string())
    }

    fn wait(&mut self, timeout_ms: u32) -> Result<bool, String> {
        self.pcm.wait(Some(timeout_ms)).map_err(|e| e.to_string())
    }

    fn avail(&mut self) -> Result<usize, String> {
        self.pcm
            .avail()
            .map(|f| f.max(0) as usize)
            .map_err(|e| e.to_string())
    }

    fn delay(&mut self) -> Result<i64, String> {
        self.pcm.delay().map(i64::from).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlsaConfig;
    use crate::format::PlaybackFormat;
    use crate::hw::alsa::AlsaMode;
    use crate::mode::PlayMode;

    #[test]
    #[ignore = "requires an ALSA playback device"]
    fn plays_silence_on_default_device() {
        let mut mode = AlsaMode::new(AlsaDriver, AlsaConfig::default());
        mode.set_format(PlaybackFormat::default());
        mode.open().unwrap();
        mode.write(&vec![0; mode.format().frame_bytes() * 4410]).unwrap();
        mode.close();
    }
}
