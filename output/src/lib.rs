//! Output sinks for a software MIDI synthesizer.
//!
//! Every backend implements [`PlayMode`]: `open` negotiates the sample
//! format with the device, file or server, `write` takes interleaved PCM in
//! the negotiated encoding, `control` answers pacing queries and session
//! events, `close` flushes and releases.

pub mod buffer;
pub mod config;
pub mod error;
pub mod file;
pub mod format;
pub mod hw;
pub mod list;
pub mod mode;
pub mod negotiate;

pub use config::OutputConfig;
pub use error::OutputError;
pub use format::{Encoding, PlaybackFormat};
pub use mode::{
    ControlReply, ControlRequest, FileInfo, MidiEvent, MidiEventKind, ModeFlags, ModeInfo,
    OpenStatus, PlayMode, write_all,
};

use buffer::BufferMode;
use file::aiff::AiffMode;
use file::flac::FlacMode;
use file::raw::RawMode;
use hw::netaudio::NetAudioMode;
use list::ListMode;

/// Every backend compiled into this build, devices first.
pub fn mode_list(config: &OutputConfig) -> Vec<Box<dyn PlayMode>> {
    let mut modes: Vec<Box<dyn PlayMode>> = Vec::new();
    #[cfg(all(feature = "alsa", target_os = "linux"))]
    modes.push(Box::new(hw::alsa::AlsaMode::new(
        hw::alsa::AlsaDriver,
        config.alsa.clone(),
    )));
    #[cfg(windows)]
    modes.push(Box::new(hw::waveout::WaveOutMode::new(
        hw::waveout::WinMmDriver,
        config.waveout.clone(),
    )));
    modes.push(Box::new(NetAudioMode::new(config.netaudio.clone())));
    modes.push(Box::new(RawMode::from_config(config)));
    modes.push(Box::new(AiffMode::from_config(config)));
    modes.push(Box::new(FlacMode::from_config(config)));
    #[cfg(feature = "vorbis")]
    modes.push(Box::new(file::vorbis::VorbisMode::from_config(config)));
    #[cfg(feature = "speex")]
    modes.push(Box::new(file::speex::SpeexMode::from_config(config)));
    modes.push(Box::new(BufferMode::new(config.buffer.capacity)));
    modes.push(Box::new(ListMode::new()));
    modes
}

pub fn find_mode(id: char, config: &OutputConfig) -> Option<Box<dyn PlayMode>> {
    mode_list(config).into_iter().find(|mode| mode.info().id == id)
}
