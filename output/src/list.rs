//! Introspection mode: instead of sound it collects which instruments and
//! drum notes a song uses and prints a table when playback ends.

use crate::error::OutputError;
use crate::file::OutputFile;
use crate::mode::{
    ControlReply, ControlRequest, MidiEvent, MidiEventKind, ModeCore, ModeFlags, OpenStatus,
    PlayMode,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write;
use tracing::{error, info};

const DEFAULT_DRUM_CHANNEL: u8 = 9;
const CHANNELS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Usage {
    pub first_time: u64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    bank: u8,
    program: u8,
}

#[derive(Debug)]
pub struct ListMode {
    core: ModeCore,
    open: bool,
    drum_channels: u16,
    channels: [ChannelState; CHANNELS],
    instruments: BTreeMap<(u8, u8), Usage>,
    drums: BTreeMap<(u8, u8), Usage>,
    title: Option<String>,
}

impl Default for ListMode {
    fn default() -> Self {
        Self::new()
    }
}

impl ListMode {
    pub fn new() -> Self {
        Self {
            core: ModeCore::new(
                'l',
                "List MIDI event",
                ModeFlags::MIDI_EVENT | ModeFlags::FILE_OUTPUT,
            ),
            open: false,
            drum_channels: 1 << DEFAULT_DRUM_CHANNEL,
            channels: [ChannelState::default(); CHANNELS],
            instruments: BTreeMap::new(),
            drums: BTreeMap::new(),
            title: None,
        }
    }

    pub fn instruments(&self) -> &BTreeMap<(u8, u8), Usage> {
        &self.instruments
    }

    pub fn drums(&self) -> &BTreeMap<(u8, u8), Usage> {
        &self.drums
    }

    fn reset(&mut self) {
        self.channels = [ChannelState::default(); CHANNELS];
        self.drum_channels = 1 << DEFAULT_DRUM_CHANNEL;
        self.instruments.clear();
        self.drums.clear();
    }

    fn is_drum(&self, channel: u8) -> bool {
        (channel as usize) < CHANNELS && self.drum_channels & (1 << channel) != 0
    }

    fn record(&mut self, event: &MidiEvent) {
        let ch = (event.channel as usize) % CHANNELS;
        match event.kind {
            MidiEventKind::ProgramChange => self.channels[ch].program = event.a,
            MidiEventKind::Controller if event.a == 0 => self.channels[ch].bank = event.b,
            MidiEventKind::NoteOn if event.b > 0 => {
                let state = self.channels[ch];
                let (table, key) = if self.is_drum(event.channel) {
                    (&mut self.drums, (state.program, event.a))
                } else {
                    (&mut self.instruments, (state.bank, state.program))
                };
                table
                    .entry(key)
                    .and_modify(|u| u.count += 1)
                    .or_insert(Usage {
                        first_time: event.time,
                        count: 1,
                    });
            }
            _ => {}
        }
    }

    /// Human-readable usage table, times in minutes:seconds at the current rate.
    pub fn report(&self) -> String {
        let rate = u64::from(self.core.format.rate.max(1));
        let stamp = |samples: u64| {
            let ms = samples * 1000 / rate;
            format!("{}:{:02}.{:03}", ms / 60_000, (ms / 1000) % 60, ms % 1000)
        };
        let mut out = String::new();
        if let Some(title) = &self.title {
            let _ = writeln!(out, "{title}");
        }
        let _ = writeln!(out, "Instruments: {}", self.instruments.len());
        let _ = writeln!(out, "{:>5} {:>5} {:>12} {:>7}", "Bank", "Prog", "First", "Notes");
        for ((bank, program), usage) in &self.instruments {
            let _ = writeln!(
                out,
                "{bank:>5} {program:>5} {:>12} {:>7}",
                stamp(usage.first_time),
                usage.count
            );
        }
        let _ = writeln!(out, "Drum notes: {}", self.drums.len());
        let _ = writeln!(out, "{:>5} {:>5} {:>12} {:>7}", "Set", "Note", "First", "Notes");
        for ((set, note), usage) in &self.drums {
            let _ = writeln!(
                out,
                "{set:>5} {note:>5} {:>12} {:>7}",
                stamp(usage.first_time),
                usage.count
            );
        }
        out
    }

    fn emit_report(&mut self) -> Result<(), OutputError> {
        let name = self.core.name.clone().unwrap_or_else(|| "-".to_string());
        let mut file = OutputFile::create(&name)?;
        file.write_all(self.report().as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| OutputError::io(name.clone(), e))?;
        info!("event list written to {name}");
        Ok(())
    }
}

impl PlayMode for ListMode {
    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn open(&mut self) -> Result<OpenStatus, OutputError> {
        self.reset();
        self.open = true;
        Ok(OpenStatus::Exact)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
        if !self.open {
            return Err(OutputError::NotOpen);
        }
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError> {
        let session_event = matches!(
            request,
            ControlRequest::Midi(_) | ControlRequest::PlayStart(_) | ControlRequest::PlayEnd
        );
        if session_event && !self.open {
            return Err(OutputError::NotOpen);
        }
        match request {
            ControlRequest::Midi(event) => {
                self.record(&event);
                Ok(ControlReply::Done)
            }
            ControlRequest::PlayStart(file) => {
                self.reset();
                self.title = Some(file.seq_name.unwrap_or(file.filename));
                Ok(ControlReply::Done)
            }
            ControlRequest::PlayEnd => {
                if let Err(e) = self.emit_report() {
                    error!("{e}");
                    return Err(e);
                }
                Ok(ControlReply::Done)
            }
            ControlRequest::Discard | ControlRequest::Flush => Ok(ControlReply::Done),
            _ => Err(OutputError::Unsupported),
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
