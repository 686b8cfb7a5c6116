//! Ogg-Speex output.
//!
//! Packets come from libspeex through a small [`SpeexCodec`] seam; the Speex
//! and comment headers and the Ogg framing are produced here.

use super::encoder::{EncoderMode, Pcm16Splitter, StreamEncoder, negotiate_pcm16};
use super::{CountingWriter, OutputFile};
use crate::config::{OutputConfig, SpeexConfig};
use crate::error::{OutputError, encoder_error};
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::OpenStatus;
use byteorder::{LittleEndian, WriteBytesExt};
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use std::io::Write;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub type SpeexMode = EncoderMode<SpeexFile<LibSpeex>>;

const HEADER_SIZE: usize = 80;
const VERSION: &str = "1.2";
const VENDOR: &str = "Encoded with playmode";

/// Speex sub-codec, chosen from the sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Narrow,
    Wide,
    UltraWide,
}

impl Band {
    pub fn for_rate(rate: u32) -> Band {
        if rate > 25_000 {
            Band::UltraWide
        } else if rate > 12_500 {
            Band::Wide
        } else {
            Band::Narrow
        }
    }

    pub fn mode_id(self) -> i32 {
        match self {
            Band::Narrow => 0,
            Band::Wide => 1,
            Band::UltraWide => 2,
        }
    }
}

pub trait SpeexCodec: Send + Sized {
    fn new(band: Band, rate: u32, settings: &SpeexConfig) -> Result<Self, String>;

    /// Samples per channel in one Speex frame.
    fn frame_size(&self) -> usize;

    fn lookahead(&self) -> usize;

    /// Encodes `frames` consecutive Speex frames of interleaved PCM into one
    /// packet. `pcm` may be overwritten.
    fn encode_packet(&mut self, pcm: &mut [i16], channels: usize, frames: usize) -> Vec<u8>;
}

/// The 80-byte little-endian Speex stream header.
pub fn speex_header(
    rate: u32,
    band: Band,
    channels: usize,
    frame_size: usize,
    settings: &SpeexConfig,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    out.extend_from_slice(b"Speex   ");
    let mut version = [0_u8; 20];
    version[..VERSION.len()].copy_from_slice(VERSION.as_bytes());
    out.extend_from_slice(&version);
    let fields = [
        1,
        HEADER_SIZE as i32,
        rate as i32,
        band.mode_id(),
        4,
        channels as i32,
        -1,
        frame_size as i32,
        i32::from(settings.vbr),
        settings.frames_per_packet.max(1) as i32,
        0,
        0,
        0,
    ];
    for field in fields {
        let _ = out.write_i32::<LittleEndian>(field);
    }
    out
}

/// Vorbis-comment style packet carrying only the vendor string.
pub fn comment_packet() -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + VENDOR.len());
    let _ = out.write_u32::<LittleEndian>(VENDOR.len() as u32);
    out.extend_from_slice(VENDOR.as_bytes());
    let _ = out.write_u32::<LittleEndian>(0);
    out
}

fn stream_serial() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() ^ d.as_secs() as u32)
        .unwrap_or(0x5350_4558)
}

pub struct SpeexFile<C: SpeexCodec> {
    codec: C,
    ogg: PacketWriter<'static, CountingWriter<OutputFile>>,
    path: String,
    serial: u32,
    channels: usize,
    frames_per_packet: usize,
    split: Pcm16Splitter,
    pending: Vec<i16>,
    /// Last encoded packet, held back so the stream can end on it.
    held: Option<Vec<u8>>,
    samples_in: u64,
    frames_encoded: u64,
}

impl<C: SpeexCodec> SpeexFile<C> {
    fn packet_samples(&self) -> usize {
        self.codec.frame_size() * self.frames_per_packet * self.channels
    }

    fn write_packet(
        &mut self,
        packet: Vec<u8>,
        end: PacketWriteEndInfo,
        granule: u64,
    ) -> Result<(), OutputError> {
        self.ogg
            .write_packet(packet, self.serial, end, granule)
            .map_err(|e| OutputError::io(self.path.as_str(), e))
    }

    fn encode_one(&mut self, mut pcm: Vec<i16>) -> Result<(), OutputError> {
        let packet = self
            .codec
            .encode_packet(&mut pcm, self.channels, self.frames_per_packet);
        if let Some(previous) = self.held.take() {
            let granule = self
                .frames_encoded
                .saturating_sub(self.codec.lookahead() as u64);
            self.write_packet(previous, PacketWriteEndInfo::NormalPacket, granule)?;
        }
        self.frames_encoded += (self.frames_per_packet * self.codec.frame_size()) as u64;
        self.held = Some(packet);
        Ok(())
    }
}

impl<C: SpeexCodec> StreamEncoder for SpeexFile<C> {
    const ID: char = 'S';
    const DESCRIPTION: &'static str = "Ogg Speex";
    const LABEL: &'static str = "Ogg Speex";

    type Settings = SpeexConfig;

    fn settings(config: &OutputConfig) -> SpeexConfig {
        config.speex.clone()
    }

    fn negotiate(format: &mut PlaybackFormat) -> OpenStatus {
        negotiate_pcm16(Self::LABEL, format)
    }

    fn extension(_encoding: Encoding) -> String {
        ".spx".to_string()
    }

    fn start(
        out: OutputFile,
        path: &str,
        format: &PlaybackFormat,
        settings: &SpeexConfig,
    ) -> Result<Self, OutputError> {
        let band = Band::for_rate(format.rate);
        let codec = C::new(band, format.rate, settings)
            .map_err(|e| OutputError::Encoder(encoder_error(Self::LABEL, path, e)))?;
        let channels = format.channels();
        debug!(
            "Speex {band:?} band, {} samples per frame, {} frames per packet",
            codec.frame_size(),
            settings.frames_per_packet
        );
        let header = speex_header(format.rate, band, channels, codec.frame_size(), settings);
        let mut file = Self {
            codec,
            ogg: PacketWriter::new(CountingWriter::flushing(out)),
            path: path.to_string(),
            serial: stream_serial(),
            channels,
            frames_per_packet: settings.frames_per_packet.max(1),
            split: Pcm16Splitter::default(),
            pending: Vec::new(),
            held: None,
            samples_in: 0,
            frames_encoded: 0,
        };
        file.write_packet(header, PacketWriteEndInfo::EndPage, 0)?;
        file.write_packet(comment_packet(), PacketWriteEndInfo::EndPage, 0)?;
        Ok(file)
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<(), OutputError> {
        let before = self.pending.len();
        self.split.split(pcm, &mut self.pending);
        self.samples_in += (self.pending.len() - before) as u64;
        let size = self.packet_samples();
        while self.pending.len() >= size {
            let packet: Vec<i16> = self.pending.drain(..size).collect();
            self.encode_one(packet)?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<u64, OutputError> {
        // Pad the tail with silence; an empty stream still gets one packet so
        // it can carry the end-of-stream flag.
        if !self.pending.is_empty() || self.held.is_none() {
            let mut tail = std::mem::take(&mut self.pending);
            tail.resize(self.packet_samples(), 0);
            self.encode_one(tail)?;
        }
        if let Some(last) = self.held.take() {
            let granule = self.samples_in / self.channels as u64;
            self.write_packet(last, PacketWriteEndInfo::EndStream, granule)?;
        }
        let mut sink = self.ogg.into_inner();
        sink.flush()
            .map_err(|e| OutputError::io(self.path.as_str(), e))?;
        Ok(sink.count())
    }
}

/// Encoder backed by the system libspeex.
pub struct LibSpeex {
    state: *mut ffi::c_void,
    bits: ffi::SpeexBits,
    frame_size: usize,
    lookahead: usize,
}

// The encoder state is owned by one session and only used through `&mut self`.
unsafe impl Send for LibSpeex {}

impl SpeexCodec for LibSpeex {
    fn new(band: Band, rate: u32, settings: &SpeexConfig) -> Result<Self, String> {
        let mode = unsafe { ffi::speex_lib_get_mode(band.mode_id()) };
        if mode.is_null() {
            return Err(format!("libspeex has no {band:?} mode"));
        }
        let state = unsafe { ffi::speex_encoder_init(mode) };
        if state.is_null() {
            return Err("speex_encoder_init failed".to_string());
        }
        let mut codec = LibSpeex {
            state,
            bits: ffi::SpeexBits::default(),
            frame_size: 0,
            lookahead: 0,
        };
        unsafe { ffi::speex_bits_init(&mut codec.bits) };

        let mut value: ffi::c_int = settings.complexity.clamp(1, 10);
        codec.ctl(ffi::SPEEX_SET_COMPLEXITY, &mut value);
        let mut value: ffi::c_int = rate as ffi::c_int;
        codec.ctl(ffi::SPEEX_SET_SAMPLING_RATE, &mut value);
        if settings.vbr {
            let mut value: ffi::c_int = 1;
            codec.ctl(ffi::SPEEX_SET_VBR, &mut value);
            let mut quality = settings.quality.clamp(0, 10) as f32;
            unsafe {
                ffi::speex_encoder_ctl(
                    codec.state,
                    ffi::SPEEX_SET_VBR_QUALITY,
                    (&mut quality as *mut f32).cast(),
                )
            };
        } else {
            let mut value: ffi::c_int = settings.quality.clamp(0, 10);
            codec.ctl(ffi::SPEEX_SET_QUALITY, &mut value);
        }
        let mut value: ffi::c_int = 0;
        codec.ctl(ffi::SPEEX_GET_FRAME_SIZE, &mut value);
        codec.frame_size = value.max(1) as usize;
        let mut value: ffi::c_int = 0;
        codec.ctl(ffi::SPEEX_GET_LOOKAHEAD, &mut value);
        codec.lookahead = value.max(0) as usize;
        Ok(codec)
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn lookahead(&self) -> usize {
        self.lookahead
    }

    fn encode_packet(&mut self, pcm: &mut [i16], channels: usize, frames: usize) -> Vec<u8> {
        let step = self.frame_size * channels;
        unsafe { ffi::speex_bits_reset(&mut self.bits) };
        for frame in pcm.chunks_exact_mut(step).take(frames) {
            unsafe {
                if channels == 2 {
                    ffi::speex_encode_stereo_int(
                        frame.as_mut_ptr(),
                        self.frame_size as ffi::c_int,
                        &mut self.bits,
                    );
                }
                ffi::speex_encode_int(self.state, frame.as_mut_ptr(), &mut self.bits);
            }
        }
        let len = unsafe { ffi::speex_bits_nbytes(&mut self.bits) }.max(0) as usize;
        let mut out = vec![0_u8; len];
        let written = unsafe {
            ffi::speex_bits_write(&mut self.bits, out.as_mut_ptr().cast(), len as ffi::c_int)
        };
        out.truncate(written.max(0) as usize);
        out
    }
}

impl LibSpeex {
    fn ctl(&mut self, request: ffi::c_int, value: &mut ffi::c_int) {
        unsafe {
            ffi::speex_encoder_ctl(self.state, request, (value as *mut ffi::c_int).cast())
        };
    }
}

impl Drop for LibSpeex {
    fn drop(&mut self) {
        unsafe {
            ffi::speex_encoder_destroy(self.state);
            ffi::speex_bits_destroy(&mut self.bits);
        }
    }
}

mod ffi {
    pub use std::ffi::{c_char, c_int, c_void};

    pub const SPEEX_GET_FRAME_SIZE: c_int = 3;
    pub const SPEEX_SET_QUALITY: c_int = 4;
    pub const SPEEX_SET_VBR: c_int = 12;
    pub const SPEEX_SET_VBR_QUALITY: c_int = 14;
    pub const SPEEX_SET_COMPLEXITY: c_int = 16;
    pub const SPEEX_SET_SAMPLING_RATE: c_int = 24;
    pub const SPEEX_GET_LOOKAHEAD: c_int = 31;

    #[repr(C)]
    pub struct SpeexMode {
        _private: [u8; 0],
    }

    #[repr(C)]
    #[allow(dead_code)]
    pub struct SpeexBits {
        chars: *mut c_char,
        nb_bits: c_int,
        char_ptr: c_int,
        bit_ptr: c_int,
        owner: c_int,
        overflow: c_int,
        buf_size: c_int,
        reserved1: c_int,
        reserved2: *mut c_void,
    }

    impl Default for SpeexBits {
        fn default() -> Self {
            Self {
                chars: std::ptr::null_mut(),
                nb_bits: 0,
                char_ptr: 0,
                bit_ptr: 0,
                owner: 0,
                overflow: 0,
                buf_size: 0,
                reserved1: 0,
                reserved2: std::ptr::null_mut(),
            }
        }
    }

    #[link(name = "speex")]
    unsafe extern "C" {
        pub fn speex_lib_get_mode(mode: c_int) -> *const SpeexMode;
        pub fn speex_encoder_init(mode: *const SpeexMode) -> *mut c_void;
        pub fn speex_encoder_ctl(state: *mut c_void, request: c_int, ptr: *mut c_void) -> c_int;
        pub fn speex_encoder_destroy(state: *mut c_void);
        pub fn speex_encode_int(state: *mut c_void, input: *mut i16, bits: *mut SpeexBits) -> c_int;
        pub fn speex_encode_stereo_int(data: *mut i16, frame_size: c_int, bits: *mut SpeexBits);
        pub fn speex_bits_init(bits: *mut SpeexBits);
        pub fn speex_bits_reset(bits: *mut SpeexBits);
        pub fn speex_bits_destroy(bits: *mut SpeexBits);
        pub fn speex_bits_nbytes(bits: *mut SpeexBits) -> c_int;
        pub fn speex_bits_write(bits: *mut SpeexBits, bytes: *mut c_char, max_len: c_int) -> c_int;
    }
}
