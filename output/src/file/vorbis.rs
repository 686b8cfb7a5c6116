//! Ogg-Vorbis output through `vorbis_rs`.

use super::encoder::{EncoderMode, Pcm16Splitter, StreamEncoder, negotiate_pcm16};
use super::{CountingWriter, OutputFile};
use crate::config::{OutputConfig, VorbisConfig};
use crate::error::{OutputError, encoder_error};
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::OpenStatus;
use std::io::Write;
use std::num::{NonZeroU8, NonZeroU32};
use vorbis_rs::{VorbisBitrateManagementStrategy, VorbisEncoder, VorbisEncoderBuilder};

pub type VorbisMode = EncoderMode<VorbisFile>;

const DEFAULT_QUALITY: f32 = 0.4;

/// Rate control for the session. An explicit quality wins over a bitrate.
pub fn strategy(config: &VorbisConfig) -> VorbisBitrateManagementStrategy {
    match (config.quality, config.bitrate.and_then(NonZeroU32::new)) {
        (Some(q), _) => VorbisBitrateManagementStrategy::QualityVbr {
            target_quality: q.clamp(-0.1, 1.0),
        },
        (None, Some(bitrate)) => VorbisBitrateManagementStrategy::Vbr {
            target_bitrate: bitrate,
        },
        (None, None) => VorbisBitrateManagementStrategy::QualityVbr {
            target_quality: DEFAULT_QUALITY,
        },
    }
}

pub struct VorbisFile {
    encoder: VorbisEncoder<CountingWriter<OutputFile>>,
    path: String,
    channels: usize,
    split: Pcm16Splitter,
    pending: Vec<i16>,
    planes: Vec<Vec<f32>>,
}

// The encoder state is only touched through `&mut self` by the owning mode.
unsafe impl Send for VorbisFile {}

impl VorbisFile {
    fn fail(&self, err: impl std::fmt::Display) -> OutputError {
        OutputError::Encoder(encoder_error(Self::LABEL, &self.path, err))
    }
}

impl StreamEncoder for VorbisFile {
    const ID: char = 'v';
    const DESCRIPTION: &'static str = "Ogg Vorbis";
    const LABEL: &'static str = "Ogg Vorbis";

    type Settings = VorbisConfig;

    fn settings(config: &OutputConfig) -> VorbisConfig {
        config.vorbis.clone()
    }

    fn negotiate(format: &mut PlaybackFormat) -> OpenStatus {
        negotiate_pcm16(Self::LABEL, format)
    }

    fn extension(_encoding: Encoding) -> String {
        ".ogg".to_string()
    }

    fn start(
        out: OutputFile,
        path: &str,
        format: &PlaybackFormat,
        settings: &VorbisConfig,
    ) -> Result<Self, OutputError> {
        let fail = |e: String| OutputError::Encoder(encoder_error(Self::LABEL, path, e));
        let rate = NonZeroU32::new(format.rate).ok_or_else(|| fail("zero sample rate".into()))?;
        let channels = format.channels();
        let channel_count = u8::try_from(channels)
            .ok()
            .and_then(NonZeroU8::new)
            .ok_or_else(|| fail(format!("unsupported channel count {channels}")))?;

        let mut builder = VorbisEncoderBuilder::new(rate, channel_count, CountingWriter::flushing(out))
            .map_err(|e| fail(e.to_string()))?;
        builder.bitrate_management_strategy(strategy(settings));
        let encoder = builder.build().map_err(|e| fail(e.to_string()))?;
        Ok(Self {
            encoder,
            path: path.to_string(),
            channels,
            split: Pcm16Splitter::default(),
            pending: Vec::new(),
            planes: vec![Vec::new(); channels],
        })
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<(), OutputError> {
        self.split.split(pcm, &mut self.pending);
        let frames = self.pending.len() / self.channels;
        if frames == 0 {
            return Ok(());
        }
        for plane in &mut self.planes {
            plane.clear();
        }
        for frame in self.pending[..frames * self.channels].chunks_exact(self.channels) {
            for (plane, sample) in self.planes.iter_mut().zip(frame) {
                plane.push(f32::from(*sample) / 32_768.0);
            }
        }
        self.pending.drain(..frames * self.channels);
        if let Err(e) = self.encoder.encode_audio_block(&self.planes) {
            return Err(self.fail(e));
        }
        Ok(())
    }

    fn finish(self) -> Result<u64, OutputError> {
        let path = self.path;
        let mut sink = self
            .encoder
            .finish()
            .map_err(|e| OutputError::Encoder(encoder_error(Self::LABEL, &path, e)))?;
        sink.flush().map_err(|e| OutputError::io(path.as_str(), e))?;
        Ok(sink.count())
    }
}
