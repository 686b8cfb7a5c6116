use crate::error::OutputError;
use crate::format::{Encoding, PlaybackFormat};
use bitflags::bitflags;

bitflags! {
    /// Capabilities advertised by an output mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModeFlags: u32 {
        /// Consumes a continuous PCM stream.
        const PCM_STREAM = 0x01;
        /// Can report playback position for tracing displays.
        const CAN_TRACE = 0x02;
        /// Honours fragment count/size in `extra_param`.
        const BUFF_FRAGM_OPT = 0x04;
        /// Opens one output file per input file on PLAY_START.
        const AUTO_SPLIT_FILE = 0x08;
        /// Writes to a file rather than a device.
        const FILE_OUTPUT = 0x10;
        /// Receives decoded MIDI events through `control`.
        const MIDI_EVENT = 0x20;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeInfo {
    pub id: char,
    pub name: &'static str,
    pub flags: ModeFlags,
}

/// Outcome of a successful `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// The requested format was accepted unchanged.
    Exact,
    /// The backend substituted rate, channel count or encoding.
    Adjusted,
}

/// Input file metadata used to name auto-split outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub seq_name: Option<String>,
}

impl FileInfo {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            seq_name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiEventKind {
    NoteOff,
    NoteOn,
    KeyPressure,
    Controller,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    Tempo,
    EndOfTrack,
}

/// A decoded MIDI event with its time in output samples.
///
/// `a` and `b` carry the message data bytes (note/velocity, controller/value,
/// program, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    pub time: u64,
    pub kind: MidiEventKind,
    pub channel: u8,
    pub a: u8,
    pub b: u8,
}

impl MidiEvent {
    pub fn new(time: u64, kind: MidiEventKind, channel: u8, a: u8, b: u8) -> Self {
        Self {
            time,
            kind,
            channel,
            a,
            b,
        }
    }
}

/// Side-channel requests that do not fit `write`/`close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    PlayStart(FileInfo),
    PlayEnd,
    /// Drop queued audio; the next `write` must succeed without reopening.
    Discard,
    /// Play out queued audio, then reset position counters.
    Flush,
    GetFragSize,
    GetQSize,
    GetFillable,
    GetFilled,
    GetSamples,
    Midi(MidiEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    Bytes(usize),
    Frames(u64),
}

/// State every mode shares: its identity, the negotiated format and the
/// optional explicit output name.
#[derive(Debug, Clone)]
pub struct ModeCore {
    pub info: ModeInfo,
    pub format: PlaybackFormat,
    pub name: Option<String>,
}

impl ModeCore {
    pub fn new(id: char, name: &'static str, flags: ModeFlags) -> Self {
        Self {
            info: ModeInfo { id, name, flags },
            format: PlaybackFormat::default(),
            name: None,
        }
    }
}

/// The uniform playback sink interface every backend satisfies.
pub trait PlayMode: Send {
    fn core(&self) -> &ModeCore;

    fn core_mut(&mut self) -> &mut ModeCore;

    /// Negotiates the format and acquires the device, file or session.
    fn open(&mut self) -> Result<OpenStatus, OutputError>;

    /// Submits PCM bytes in the negotiated encoding; returns bytes consumed.
    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError>;

    /// Flushes and releases resources. Safe when never opened or already closed.
    fn close(&mut self);

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError>;

    fn is_open(&self) -> bool;

    fn detect(&self) -> bool {
        true
    }

    fn info(&self) -> ModeInfo {
        self.core().info
    }

    fn format(&self) -> PlaybackFormat {
        self.core().format
    }

    fn set_format(&mut self, format: PlaybackFormat) {
        self.core_mut().format = format;
    }

    fn rate(&self) -> u32 {
        self.core().format.rate
    }

    fn encoding(&self) -> Encoding {
        self.core().format.encoding
    }

    fn set_output_name(&mut self, name: Option<String>) {
        self.core_mut().name = name;
    }

    fn output_name(&self) -> Option<&str> {
        self.core().name.as_deref()
    }
}

/// Writes the whole buffer, retrying partial acceptance.
pub fn write_all(mode: &mut dyn PlayMode, mut buf: &[u8]) -> Result<(), OutputError> {
    while !buf.is_empty() {
        let n = mode.write(buf)?;
        if n == 0 {
            return Err(OutputError::Device(format!(
                "{} accepted no data",
                mode.info().name
            )));
        }
        buf = &buf[n.min(buf.len())..];
    }
    Ok(())
}
