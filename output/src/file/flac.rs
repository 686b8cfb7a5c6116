//! FLAC output through `flacenc`.
//!
//! The stream marker and a placeholder STREAMINFO are written when the
//! session starts. Every full block is encoded into a frame and written out
//! at once; `finish` encodes the short tail block and seeks back to fill in
//! the sample count and frame sizes.

use super::OutputFile;
use super::encoder::{EncoderMode, Pcm16Splitter, StreamEncoder, negotiate_pcm16};
use crate::config::{FlacConfig, OutputConfig};
use crate::error::{OutputError, encoder_error};
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::OpenStatus;
use byteorder::{BigEndian, WriteBytesExt};
use flacenc::bitsink::ByteSink;
use flacenc::component::{BitRepr, StreamInfo};
use flacenc::error::{Verified, Verify};
use flacenc::source::{Fill, FrameBuf};
use std::io::{self, Seek, SeekFrom, Write};
use tracing::debug;

pub type FlacMode = EncoderMode<FlacFile>;

const BITS_PER_SAMPLE: usize = 16;
const MIN_BLOCK_SIZE: usize = 16;
const MAX_BLOCK_SIZE: usize = 65_535;
pub const HEADER_BYTES: usize = 42;

/// Stream marker plus a lone STREAMINFO block.
///
/// Zero frame sizes and a zero sample count mean "unknown". The MD5
/// signature is left unset.
pub fn stream_header(
    rate: u32,
    channels: usize,
    block_size: usize,
    frame_bytes: (u32, u32),
    total_samples: u64,
) -> Vec<u8> {
    let block = block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE) as u16;
    let mut out = Vec::with_capacity(HEADER_BYTES);
    out.extend_from_slice(b"fLaC");
    // Last-metadata-block flag, type 0 (STREAMINFO), 34 bytes.
    out.extend_from_slice(&[0x80, 0x00, 0x00, 34]);
    let _ = out.write_u16::<BigEndian>(block);
    let _ = out.write_u16::<BigEndian>(block);
    let _ = out.write_u24::<BigEndian>(frame_bytes.0.min(0xFF_FFFF));
    let _ = out.write_u24::<BigEndian>(frame_bytes.1.min(0xFF_FFFF));
    let packed = (u64::from(rate) & 0xF_FFFF) << 44
        | ((channels as u64 - 1) & 0x7) << 41
        | ((BITS_PER_SAMPLE as u64 - 1) & 0x1F) << 36
        | (total_samples & 0xF_FFFF_FFFF);
    let _ = out.write_u64::<BigEndian>(packed);
    out.extend_from_slice(&[0; 16]);
    out
}

pub struct FlacFile {
    out: OutputFile,
    path: String,
    rate: u32,
    channels: usize,
    block_size: usize,
    config: Verified<flacenc::config::Encoder>,
    info: StreamInfo,
    framebuf: FrameBuf,
    split: Pcm16Splitter,
    pending: Vec<i16>,
    wide: Vec<i32>,
    frames: usize,
    samples: u64,
    frame_bytes: (u32, u32),
    written: u64,
}

impl FlacFile {
    fn fail(&self, err: impl std::fmt::Display) -> OutputError {
        OutputError::Encoder(encoder_error(Self::LABEL, &self.path, err))
    }

    fn io_fail(&self, err: io::Error) -> OutputError {
        OutputError::io(self.path.as_str(), err)
    }

    fn header(&self) -> Vec<u8> {
        stream_header(
            self.rate,
            self.channels,
            self.block_size,
            self.frame_bytes,
            self.samples,
        )
    }

    /// Encodes whole frames of interleaved samples into one FLAC frame.
    fn emit(&mut self, block: &[i16]) -> Result<(), OutputError> {
        self.wide.clear();
        self.wide.extend(block.iter().map(|s| i32::from(*s)));
        if let Err(e) = self.framebuf.fill_interleaved(&self.wide) {
            return Err(self.fail(format!("{e:?}")));
        }
        let frame = match flacenc::encode_fixed_size_frame(
            &self.config,
            &self.framebuf,
            self.frames,
            &self.info,
        ) {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(format!("{e:?}"))),
        };
        let mut sink = ByteSink::new();
        if frame.write(&mut sink).is_err() {
            return Err(self.fail("frame serialization failed"));
        }
        let bytes = sink.as_slice();
        if let Err(e) = self.out.write_all(bytes).and_then(|_| self.out.flush()) {
            return Err(self.io_fail(e));
        }

        let len = bytes.len() as u32;
        self.frame_bytes = if self.frames == 0 {
            (len, len)
        } else {
            (self.frame_bytes.0.min(len), self.frame_bytes.1.max(len))
        };
        self.frames += 1;
        self.samples += (block.len() / self.channels) as u64;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Rewrites STREAMINFO with the final counts. Unseekable outputs keep
    /// the placeholder.
    fn patch_header(&mut self) -> io::Result<()> {
        let header = self.header();
        if let Err(e) = self.out.seek(SeekFrom::Start(0)) {
            debug!("FLAC output is not seekable, STREAMINFO left unpatched: {e}");
            return Ok(());
        }
        self.out.write_all(&header)?;
        self.out.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

impl StreamEncoder for FlacFile {
    const ID: char = 'F';
    const DESCRIPTION: &'static str = "FLAC";
    const LABEL: &'static str = "FLAC";

    type Settings = FlacConfig;

    fn settings(config: &OutputConfig) -> FlacConfig {
        config.flac.clone()
    }

    fn negotiate(format: &mut PlaybackFormat) -> OpenStatus {
        negotiate_pcm16(Self::LABEL, format)
    }

    fn extension(_encoding: Encoding) -> String {
        ".flac".to_string()
    }

    fn start(
        out: OutputFile,
        path: &str,
        format: &PlaybackFormat,
        settings: &FlacConfig,
    ) -> Result<Self, OutputError> {
        let fail = |e: String| OutputError::Encoder(encoder_error(Self::LABEL, path, e));
        let block_size = settings.block_size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
        let channels = format.channels();

        let mut config = flacenc::config::Encoder::default();
        config.block_size = block_size;
        let config = config
            .into_verified()
            .map_err(|(_, e)| fail(format!("invalid configuration: {e:?}")))?;
        let info = StreamInfo::new(format.rate as usize, channels, BITS_PER_SAMPLE)
            .map_err(|e| fail(format!("{e:?}")))?;
        let framebuf =
            FrameBuf::with_size(channels, block_size).map_err(|e| fail(format!("{e:?}")))?;

        let mut file = Self {
            out,
            path: path.to_string(),
            rate: format.rate,
            channels,
            block_size,
            config,
            info,
            framebuf,
            split: Pcm16Splitter::default(),
            pending: Vec::new(),
            wide: Vec::with_capacity(block_size * channels),
            frames: 0,
            samples: 0,
            frame_bytes: (0, 0),
            written: HEADER_BYTES as u64,
        };
        let header = file.header();
        if let Err(e) = file.out.write_all(&header).and_then(|_| file.out.flush()) {
            return Err(file.io_fail(e));
        }
        Ok(file)
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<(), OutputError> {
        self.split.split(pcm, &mut self.pending);
        let block_samples = self.block_size * self.channels;
        if self.pending.len() < block_samples {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        let mut blocks = pending.chunks_exact(block_samples);
        for block in blocks.by_ref() {
            self.emit(block)?;
        }
        self.pending = blocks.remainder().to_vec();
        Ok(())
    }

    fn finish(mut self) -> Result<u64, OutputError> {
        let tail = std::mem::take(&mut self.pending);
        let whole = tail.len() / self.channels * self.channels;
        if whole > 0 {
            self.emit(&tail[..whole])?;
        }
        if let Err(e) = self.patch_header().and_then(|_| self.out.flush()) {
            return Err(self.io_fail(e));
        }
        debug!(
            "FLAC: {} samples in {} frames, {} bytes",
            self.samples, self.frames, self.written
        );
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::PlayMode;

    fn streaminfo(bytes: &[u8]) -> (u32, u64, u64) {
        assert_eq!(&bytes[..4], b"fLaC");
        assert_eq!(bytes[4] & 0x7F, 0, "first block must be STREAMINFO");
        let body = &bytes[8..42];
        let mut word = [0; 8];
        word.copy_from_slice(&body[10..18]);
        let packed = u64::from_be_bytes(word);
        let rate = (packed >> 44) as u32;
        let channels = ((packed >> 41) & 0x7) + 1;
        let total = packed & 0xF_FFFF_FFFF;
        (rate, channels, total)
    }

    #[test]
    fn header_carries_counts() {
        let bytes = stream_header(44_100, 2, 4096, (0, 0), 0);
        assert_eq!(bytes.len(), HEADER_BYTES);
        assert_eq!(bytes[4], 0x80);
        assert_eq!(streaminfo(&bytes), (44_100, 2, 0));

        let bytes = stream_header(48_000, 1, 1152, (12, 3000), 123_456);
        assert_eq!(streaminfo(&bytes), (48_000, 1, 123_456));
        assert_eq!(&bytes[12..15], &[0, 0, 12]);
        assert_eq!(&bytes[15..18], &[0, 0x0B, 0xB8]);
    }

    #[test]
    fn frames_reach_the_file_before_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live.flac");
        let mut mode = FlacMode::new(FlacConfig { block_size: 1024 });
        mode.set_output_name(Some(path.to_string_lossy().into_owned()));
        mode.open().unwrap();
        let on_disk = || std::fs::metadata(&path).unwrap().len();
        assert_eq!(on_disk(), HEADER_BYTES as u64);

        let pcm: Vec<u8> = (0..22_050_i32)
            .flat_map(|i| {
                let s = ((i as f32 * 0.03).sin() * 6000.0) as i16;
                let mut frame = s.to_ne_bytes().to_vec();
                frame.extend_from_slice(&(s / 2).to_ne_bytes());
                frame
            })
            .collect();
        let mut sizes = Vec::new();
        for chunk in pcm.chunks(16_384) {
            mode.write(chunk).unwrap();
            sizes.push(on_disk());
        }
        assert!(sizes[0] > HEADER_BYTES as u64);
        assert!(sizes.windows(2).all(|w| w[0] <= w[1]));
        assert!(sizes[sizes.len() - 1] > sizes[0]);

        mode.close();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(streaminfo(&bytes), (44_100, 2, 22_050));
        assert!(bytes.len() as u64 >= sizes[sizes.len() - 1]);
    }

    #[test]
    fn encodes_a_tone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.flac");
        let mut mode = FlacMode::new(FlacConfig::default());
        mode.set_format(PlaybackFormat::new(
            22_050,
            Encoding::BITS16 | Encoding::SIGNED | Encoding::MONO,
        ));
        mode.set_output_name(Some(path.to_string_lossy().into_owned()));
        mode.open().unwrap();
        let pcm: Vec<u8> = (0..5000_i32)
            .flat_map(|i| (((i % 100) - 50) as i16 * 300).to_ne_bytes())
            .collect();
        for chunk in pcm.chunks(999) {
            mode.write(chunk).unwrap();
        }
        mode.close();

        let bytes = std::fs::read(&path).unwrap();
        let (rate, channels, total) = streaminfo(&bytes);
        assert_eq!(rate, 22_050);
        assert_eq!(channels, 1);
        assert_eq!(total, 5000);
        assert!(bytes.len() < pcm.len());
    }
}
