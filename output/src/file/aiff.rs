//! AIFF (and AIFC for µ-law/A-law) file output.
//!
//! The header is written up front with sentinel sizes and rewritten from
//! [`aiff_header`] every `patch_interval` bytes and at close, so an
//! interrupted run still leaves a playable file.

use super::OutputFile;
use super::encoder::{EncoderMode, StreamEncoder};
use super::ieee80::to_ieee_extended;
use crate::config::{AiffConfig, OutputConfig};
use crate::error::OutputError;
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::OpenStatus;
use crate::negotiate::force_encoding;
use byteorder::{BigEndian, WriteBytesExt};
use std::io::{self, Seek, SeekFrom, Write};
use tracing::debug;

pub type AiffMode = EncoderMode<AiffFile>;

const UNKNOWN: u32 = 0xFFFF_FFFF;
const AIFC_VERSION_1: u32 = 0xA280_5140;

fn compression(encoding: Encoding) -> Option<(&'static [u8; 4], &'static str)> {
    if encoding.contains(Encoding::ULAW) {
        Some((b"ulaw", "\u{b5}-law 2:1"))
    } else if encoding.contains(Encoding::ALAW) {
        Some((b"alaw", "A-law 2:1"))
    } else {
        None
    }
}

/// Pascal string bytes, padded to an even total length.
fn pstring(text: &str) -> Vec<u8> {
    // The compression name is stored as Latin-1.
    let latin1: Vec<u8> = text.chars().map(|c| u8::try_from(c).unwrap_or(b'?')).collect();
    let mut out = Vec::with_capacity(latin1.len() + 2);
    out.push(latin1.len().min(255) as u8);
    out.extend_from_slice(&latin1[..latin1.len().min(255)]);
    if out.len() % 2 == 1 {
        out.push(0);
    }
    out
}

fn clamp32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(UNKNOWN)
}

/// Builds the complete header for `data_bytes` of sample data, or a header
/// with sentinel sizes when the length is not known yet. The header length
/// depends only on the format, so a later header can overwrite an earlier one.
pub fn aiff_header(format: &PlaybackFormat, data_bytes: Option<u64>) -> Vec<u8> {
    let encoding = format.encoding;
    let compressed = compression(encoding);
    let name = compressed.map(|(_, name)| pstring(name));
    let channels = format.channels() as u16;
    let bits: u16 = if compressed.is_some() {
        16
    } else {
        encoding.bit_depth() as u16
    };

    let comm_len = 18 + name.as_ref().map_or(0, |n| 4 + n.len() as u32);
    let fver_len = if compressed.is_some() { 12 } else { 0 };
    let header_len = 12 + fver_len + 8 + comm_len + 16;

    let (form_len, frames, ssnd_len) = match data_bytes {
        Some(data) => {
            let frames = data / format.frame_bytes().max(1) as u64;
            let pad = data & 1;
            (
                clamp32(u64::from(header_len) - 8 + data + pad),
                clamp32(frames),
                clamp32(8 + data),
            )
        }
        None => (UNKNOWN, UNKNOWN, UNKNOWN),
    };

    let mut out = Vec::with_capacity(header_len as usize);
    out.extend_from_slice(b"FORM");
    push_u32(&mut out, form_len);
    out.extend_from_slice(if compressed.is_some() { b"AIFC" } else { b"AIFF" });
    if compressed.is_some() {
        out.extend_from_slice(b"FVER");
        push_u32(&mut out, 4);
        push_u32(&mut out, AIFC_VERSION_1);
    }
    out.extend_from_slice(b"COMM");
    push_u32(&mut out, comm_len);
    push_u16(&mut out, channels);
    push_u32(&mut out, frames);
    push_u16(&mut out, bits);
    out.extend_from_slice(&to_ieee_extended(f64::from(format.rate)));
    if let (Some((kind, _)), Some(name)) = (compressed, name) {
        out.extend_from_slice(kind);
        out.extend_from_slice(&name);
    }
    out.extend_from_slice(b"SSND");
    push_u32(&mut out, ssnd_len);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0);
    out
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    // Writes into a Vec cannot fail.
    let _ = out.write_u32::<BigEndian>(value);
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    let _ = out.write_u16::<BigEndian>(value);
}

/// Streams sample data after an AIFF header and keeps the header current.
pub struct AiffWriter<W: Write + Seek> {
    out: W,
    format: PlaybackFormat,
    data_bytes: u64,
    since_patch: usize,
    patch_interval: usize,
    seekable: bool,
}

impl<W: Write + Seek> AiffWriter<W> {
    pub fn new(mut out: W, format: PlaybackFormat, patch_interval: usize) -> io::Result<Self> {
        out.write_all(&aiff_header(&format, None))?;
        Ok(Self {
            out,
            format,
            data_bytes: 0,
            since_patch: 0,
            patch_interval: patch_interval.max(1),
            seekable: true,
        })
    }

    pub fn data_bytes(&self) -> u64 {
        self.data_bytes
    }

    pub fn write_samples(&mut self, pcm: &[u8]) -> io::Result<()> {
        self.out.write_all(pcm)?;
        self.data_bytes += pcm.len() as u64;
        self.since_patch += pcm.len();
        if self.since_patch >= self.patch_interval {
            self.since_patch = 0;
            self.patch()?;
        }
        Ok(())
    }

    /// Rewrites the header for the data written so far. Unseekable outputs
    /// keep their sentinel header.
    fn patch(&mut self) -> io::Result<()> {
        if !self.seekable {
            return Ok(());
        }
        let header = aiff_header(&self.format, Some(self.data_bytes));
        let end = match self.out.seek(SeekFrom::Start(0)) {
            Ok(_) => SeekFrom::End(0),
            Err(e) => {
                debug!("AIFF output is not seekable, header left unpatched: {e}");
                self.seekable = false;
                return Ok(());
            }
        };
        self.out.write_all(&header)?;
        self.out.seek(end)?;
        Ok(())
    }

    /// Pads the sample chunk to even length, patches the header and returns
    /// the sink with the total file size.
    pub fn finish(mut self) -> io::Result<(W, u64)> {
        if self.data_bytes % 2 == 1 {
            self.out.write_all(&[0])?;
        }
        self.patch()?;
        self.out.flush()?;
        let header_len = aiff_header(&self.format, None).len() as u64;
        let total = header_len + self.data_bytes + (self.data_bytes & 1);
        Ok((self.out, total))
    }
}

pub struct AiffFile {
    writer: AiffWriter<OutputFile>,
    path: String,
}

impl StreamEncoder for AiffFile {
    const ID: char = 'a';
    const DESCRIPTION: &'static str = "AIFF file";
    const LABEL: &'static str = "AIFF";
    const SUMMARY: bool = false;

    type Settings = AiffConfig;

    fn settings(config: &OutputConfig) -> AiffConfig {
        config.aiff.clone()
    }

    fn negotiate(format: &mut PlaybackFormat) -> OpenStatus {
        force_encoding(
            Self::LABEL,
            format,
            Encoding::SIGNED | Encoding::big_endian(),
            Encoding::empty(),
        )
    }

    fn extension(_encoding: Encoding) -> String {
        ".aiff".to_string()
    }

    fn start(
        out: OutputFile,
        path: &str,
        format: &PlaybackFormat,
        settings: &AiffConfig,
    ) -> Result<Self, OutputError> {
        let writer = AiffWriter::new(out, *format, settings.patch_interval)
            .map_err(|e| OutputError::io(path, e))?;
        Ok(Self {
            writer,
            path: path.to_string(),
        })
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<(), OutputError> {
        self.writer
            .write_samples(pcm)
            .map_err(|e| OutputError::io(self.path.as_str(), e))
    }

    fn finish(self) -> Result<u64, OutputError> {
        let (_, total) = self
            .writer
            .finish()
            .map_err(|e| OutputError::io(self.path.as_str(), e))?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::super::ieee80::from_ieee_extended;
    use super::*;
    use crate::mode::PlayMode;
    use std::io::Cursor;

    struct Comm {
        form: [u8; 4],
        form_len: u32,
        channels: u16,
        frames: u32,
        bits: u16,
        rate: f64,
        compression: Option<[u8; 4]>,
        ssnd_len: u32,
        data_start: usize,
    }

    fn be32(b: &[u8]) -> u32 {
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn parse(bytes: &[u8]) -> Comm {
        assert_eq!(&bytes[..4], b"FORM");
        let mut form = [0; 4];
        form.copy_from_slice(&bytes[8..12]);
        let mut comm = Comm {
            form,
            form_len: be32(&bytes[4..]),
            channels: 0,
            frames: 0,
            bits: 0,
            rate: 0.0,
            compression: None,
            ssnd_len: 0,
            data_start: 0,
        };
        let mut pos = 12;
        while pos + 8 <= bytes.len() {
            let id = &bytes[pos..pos + 4];
            let len = be32(&bytes[pos + 4..]) as usize;
            let body = &bytes[pos + 8..];
            match id {
                b"COMM" => {
                    comm.channels = u16::from_be_bytes([body[0], body[1]]);
                    comm.frames = be32(&body[2..]);
                    comm.bits = u16::from_be_bytes([body[6], body[7]]);
                    let mut ext = [0; 10];
                    ext.copy_from_slice(&body[8..18]);
                    comm.rate = from_ieee_extended(ext);
                    if len > 18 {
                        let mut kind = [0; 4];
                        kind.copy_from_slice(&body[18..22]);
                        comm.compression = Some(kind);
                    }
                }
                b"SSND" => {
                    comm.ssnd_len = len as u32;
                    comm.data_start = pos + 16;
                    return comm;
                }
                _ => {}
            }
            pos += 8 + len + (len & 1);
        }
        panic!("no SSND chunk");
    }

    fn write_frames(format: PlaybackFormat, frames: usize, interval: usize) -> Vec<u8> {
        let mut writer = AiffWriter::new(Cursor::new(Vec::new()), format, interval).unwrap();
        let data: Vec<u8> = (0..frames * format.frame_bytes()).map(|i| i as u8).collect();
        for chunk in data.chunks(7) {
            writer.write_samples(chunk).unwrap();
        }
        let (cursor, total) = writer.finish().unwrap();
        let bytes = cursor.into_inner();
        assert_eq!(bytes.len() as u64, total);
        bytes
    }

    #[test]
    fn comm_round_trip() {
        for (rate, encoding, frames) in [
            (44_100, Encoding::BITS16 | Encoding::SIGNED, 1000),
            (22_050, Encoding::BITS16 | Encoding::SIGNED | Encoding::MONO, 333),
            (48_000, Encoding::BITS24 | Encoding::SIGNED, 17),
            (8_000, Encoding::SIGNED | Encoding::MONO, 101),
        ] {
            let format = PlaybackFormat::new(rate, encoding);
            let bytes = write_frames(format, frames, 64);
            let comm = parse(&bytes);
            assert_eq!(&comm.form, b"AIFF");
            assert_eq!(comm.frames as usize, frames);
            assert_eq!(comm.rate, f64::from(rate));
            assert_eq!(comm.channels as usize, format.channels());
            assert_eq!(u32::from(comm.bits), encoding.bit_depth());
            assert_eq!(comm.form_len as usize, bytes.len() - 8);
            assert_eq!(
                comm.ssnd_len as usize,
                8 + frames * format.frame_bytes()
            );
            assert_eq!(bytes[comm.data_start], 0);
        }
    }

    #[test]
    fn odd_length_data_is_padded() {
        let format = PlaybackFormat::new(8_000, Encoding::SIGNED | Encoding::MONO);
        let bytes = write_frames(format, 3, 1024);
        let comm = parse(&bytes);
        assert_eq!(comm.ssnd_len, 8 + 3);
        assert_eq!(bytes.len() % 2, 0);
        assert_eq!(comm.form_len as usize, bytes.len() - 8);
    }

    #[test]
    fn companded_output_is_aifc() {
        let format = PlaybackFormat::new(8_000, Encoding::ULAW | Encoding::MONO);
        let bytes = write_frames(format, 50, 1 << 20);
        let comm = parse(&bytes);
        assert_eq!(&comm.form, b"AIFC");
        assert_eq!(&bytes[12..16], b"FVER");
        assert_eq!(comm.compression, Some(*b"ulaw"));
        assert_eq!(comm.frames, 50);
        assert_eq!(comm.bits, 16);
    }

    #[test]
    fn placeholder_uses_sentinels() {
        let format = PlaybackFormat::default();
        let header = aiff_header(&format, None);
        assert_eq!(header.len(), 54);
        assert_eq!(be32(&header[4..]), UNKNOWN);
        assert_eq!(be32(&header[22..]), UNKNOWN);
        assert_eq!(be32(&header[42..]), UNKNOWN);
        assert_eq!(aiff_header(&format, Some(4)).len(), header.len());
    }

    #[test]
    fn header_is_patched_while_streaming() {
        let format = PlaybackFormat::new(44_100, Encoding::BITS16 | Encoding::SIGNED);
        let mut writer = AiffWriter::new(Cursor::new(Vec::new()), format, 16).unwrap();
        writer.write_samples(&[0; 12]).unwrap();
        assert_eq!(be32(&writer.out.get_ref()[22..]), UNKNOWN);
        writer.write_samples(&[0; 8]).unwrap();
        let snapshot = writer.out.get_ref().clone();
        assert_eq!(parse(&snapshot).frames, 5);
        assert_eq!(writer.out.position(), snapshot.len() as u64);
        assert_eq!(writer.data_bytes(), 20);
    }

    #[test]
    fn mode_forces_big_endian_signed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.aiff");
        let mut mode = AiffMode::new(AiffConfig::default());
        mode.set_format(PlaybackFormat::new(32_000, Encoding::BITS16));
        mode.set_output_name(Some(path.to_string_lossy().into_owned()));
        assert_eq!(mode.open().unwrap(), OpenStatus::Adjusted);
        assert!(mode.encoding().is_big_endian());
        assert!(mode.encoding().contains(Encoding::SIGNED));
        mode.write(&[0x12, 0x34, 0x56, 0x78]).unwrap();
        mode.close();
        let bytes = std::fs::read(&path).unwrap();
        let comm = parse(&bytes);
        assert_eq!(comm.frames, 1);
        assert_eq!(comm.rate, 32_000.0);
        assert_eq!(&bytes[comm.data_start..], &[0x12, 0x34, 0x56, 0x78]);
    }
}
