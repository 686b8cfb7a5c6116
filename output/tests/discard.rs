//! A discard, whether supported or not, never leaves a mode unwritable.

use playmode_output::buffer::BufferMode;
use playmode_output::config::{AlsaConfig, NetAudioConfig, OutputConfig};
use playmode_output::file::aiff::AiffMode;
use playmode_output::file::flac::FlacMode;
use playmode_output::file::raw::RawMode;
use playmode_output::hw::alsa::{AlsaMode, HwConfig, HwRequest, PcmDevice, PcmDriver, PcmError};
use playmode_output::hw::netaudio::NetAudioMode;
use playmode_output::list::ListMode;
use playmode_output::negotiate::pick_format;
use playmode_output::{ControlRequest, OutputError, PlayMode, PlaybackFormat};
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::thread;

#[cfg(feature = "speex")]
use playmode_output::config::SpeexConfig;
#[cfg(feature = "speex")]
use playmode_output::file::encoder::EncoderMode;
#[cfg(feature = "speex")]
use playmode_output::file::speex::{Band, SpeexCodec, SpeexFile};

/// A device with room for everything and nothing to recover from.
struct IdealPcm {
    frame_bytes: usize,
}

struct IdealDriver;

impl PcmDriver for IdealDriver {
    type Device = IdealPcm;

    fn open(&self, _name: &str) -> Result<IdealPcm, String> {
        Ok(IdealPcm { frame_bytes: 4 })
    }
}

impl PcmDevice for IdealPcm {
    fn configure(&mut self, request: &HwRequest) -> Result<HwConfig, OutputError> {
        let sample = pick_format("ideal", request.encoding, |_| true)?;
        self.frame_bytes = sample.encoding().bytes_per_sample() * request.channels;
        Ok(HwConfig {
            sample,
            channels: request.channels,
            rate: request.rate,
            period_frames: request.period_frames,
            buffer_frames: request.period_frames * request.periods,
        })
    }

    fn write_frames(&mut self, data: &[u8]) -> Result<usize, PcmError> {
        Ok(data.len() / self.frame_bytes.max(1))
    }

    fn prepare(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn drop_pending(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn drain(&mut self) -> Result<(), String> {
        Ok(())
    }

    fn wait(&mut self, _timeout_ms: u32) -> Result<bool, String> {
        Ok(true)
    }

    fn avail(&mut self) -> Result<usize, String> {
        Ok(4096)
    }

    fn delay(&mut self) -> Result<i64, String> {
        Ok(0)
    }
}

/// Accepts one stream and swallows whatever arrives.
fn sink_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = listener.local_addr().unwrap().to_string();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut control = BufReader::new(stream);
        let mut line = String::new();
        control.read_line(&mut line).unwrap();
        let data = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = data.local_addr().unwrap().port();
        control
            .get_mut()
            .write_all(format!("OK {port}\n").as_bytes())
            .unwrap();
        let (mut stream, _) = data.accept().unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });
    server
}

/// One byte per Speex frame, so the Ogg framing can be checked without
/// libspeex.
#[cfg(feature = "speex")]
struct ByteCodec {
    frame_size: usize,
}

#[cfg(feature = "speex")]
impl SpeexCodec for ByteCodec {
    fn new(band: Band, _rate: u32, _settings: &SpeexConfig) -> Result<Self, String> {
        let frame_size = match band {
            Band::Narrow => 160,
            Band::Wide => 320,
            Band::UltraWide => 640,
        };
        Ok(Self { frame_size })
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn lookahead(&self) -> usize {
        0
    }

    fn encode_packet(&mut self, pcm: &mut [i16], channels: usize, _frames: usize) -> Vec<u8> {
        pcm.chunks(self.frame_size * channels)
            .map(|f| f[0] as u8)
            .collect()
    }
}

fn check_discard(mode: &mut dyn PlayMode, mid_stream: bool) {
    mode.set_format(PlaybackFormat::default());
    mode.open().unwrap();
    let frame = mode.format().frame_bytes();
    if mid_stream {
        assert_eq!(mode.write(&vec![0x11; frame * 32]).unwrap(), frame * 32);
    }
    match mode.control(ControlRequest::Discard) {
        Ok(_) => {}
        Err(e) => assert!(e.is_unsupported(), "{}: {e}", mode.info().name),
    }
    let n = mode.write(&vec![0x22; frame * 8]).unwrap();
    assert_eq!(n, frame * 8, "{}", mode.info().name);
    mode.close();
    assert!(!mode.is_open());
}

fn modes(dir: &tempfile::TempDir, tag: &str) -> Vec<Box<dyn PlayMode>> {
    let config = OutputConfig::default();
    let mut raw = RawMode::from_config(&config);
    raw.set_output_name(Some(dir.path().join(format!("{tag}.raw")).display().to_string()));
    let mut aiff = AiffMode::from_config(&config);
    aiff.set_output_name(Some(dir.path().join(format!("{tag}.aiff")).display().to_string()));
    let mut list = ListMode::new();
    list.set_output_name(Some(dir.path().join(format!("{tag}.txt")).display().to_string()));
    vec![
        Box::new(BufferMode::new(256)),
        Box::new(raw),
        Box::new(aiff),
        Box::new(list),
        Box::new(AlsaMode::new(IdealDriver, AlsaConfig::default())),
        Box::new(NetAudioMode::new(NetAudioConfig {
            server: sink_server(),
            ..NetAudioConfig::default()
        })),
    ]
}

#[test]
fn discard_before_any_write() {
    let dir = tempfile::tempdir().unwrap();
    for mut mode in modes(&dir, "fresh") {
        check_discard(mode.as_mut(), false);
    }
}

#[test]
fn discard_mid_stream() {
    let dir = tempfile::tempdir().unwrap();
    for mut mode in modes(&dir, "busy") {
        check_discard(mode.as_mut(), true);
    }
}

fn named<M: PlayMode + 'static>(mut mode: M, path: &Path) -> Box<dyn PlayMode> {
    mode.set_output_name(Some(path.display().to_string()));
    Box::new(mode)
}

/// Encoders with their output paths and the magic each file starts with.
fn encoders(dir: &tempfile::TempDir, tag: &str) -> Vec<(Box<dyn PlayMode>, PathBuf, &'static [u8])> {
    let config = OutputConfig::default();
    let flac = dir.path().join(format!("{tag}.flac"));
    let mut modes = vec![(named(FlacMode::from_config(&config), &flac), flac, b"fLaC" as &[u8])];
    #[cfg(feature = "vorbis")]
    {
        let ogg = dir.path().join(format!("{tag}.ogg"));
        let mode = playmode_output::file::vorbis::VorbisMode::from_config(&config);
        modes.push((named(mode, &ogg), ogg, b"OggS" as &[u8]));
    }
    #[cfg(feature = "speex")]
    {
        let spx = dir.path().join(format!("{tag}.spx"));
        let mode = EncoderMode::<SpeexFile<ByteCodec>>::new(SpeexConfig::default());
        modes.push((named(mode, &spx), spx, b"OggS" as &[u8]));
    }
    modes
}

fn flac_total_samples(bytes: &[u8]) -> u64 {
    let mut word = [0; 8];
    word.copy_from_slice(&bytes[18..26]);
    u64::from_be_bytes(word) & 0xF_FFFF_FFFF
}

#[test]
fn encoders_finalize_after_discard() {
    let dir = tempfile::tempdir().unwrap();
    for (mid_stream, tag) in [(false, "fresh"), (true, "busy")] {
        for (mut mode, path, magic) in encoders(&dir, tag) {
            check_discard(mode.as_mut(), mid_stream);
            let bytes = fs::read(&path).unwrap();
            assert!(bytes.starts_with(magic), "{}", path.display());
            if magic == b"fLaC" {
                let expected = if mid_stream { 40 } else { 8 };
                assert_eq!(flac_total_samples(&bytes), expected);
            }
        }
    }
}
