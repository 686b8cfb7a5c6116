//! Standard MIDI files flattened into sample-timed events.

use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};
use playmode_output::{MidiEvent, MidiEventKind};
use std::fs;
use std::path::Path;

const DEFAULT_TEMPO_US: u32 = 500_000;

/// Tick to sample conversion honouring every tempo change.
#[derive(Debug, Clone)]
pub struct TempoMap {
    ppq: u64,
    /// `(tick, microseconds per quarter)` sorted by tick, one entry per tick.
    changes: Vec<(u64, u32)>,
}

impl TempoMap {
    pub fn from_smf(smf: &Smf<'_>) -> Option<Self> {
        let Timing::Metrical(ppq) = smf.header.timing else {
            return None;
        };
        let mut changes: Vec<(u64, u32)> = vec![(0, DEFAULT_TEMPO_US)];
        for track in &smf.tracks {
            let mut tick = 0_u64;
            for event in track {
                tick = tick.saturating_add(u64::from(event.delta.as_int()));
                if let TrackEventKind::Meta(MetaMessage::Tempo(us)) = event.kind {
                    changes.push((tick, us.as_int()));
                }
            }
        }
        changes.sort_by_key(|(tick, _)| *tick);
        let mut normalized: Vec<(u64, u32)> = Vec::with_capacity(changes.len());
        for (tick, tempo) in changes {
            if let Some(last) = normalized.last_mut()
                && last.0 == tick
            {
                last.1 = tempo;
            } else {
                normalized.push((tick, tempo));
            }
        }
        Some(Self {
            ppq: u64::from(ppq.as_int().max(1)),
            changes: normalized,
        })
    }

    pub fn samples(&self, tick: u64, rate: u32) -> u64 {
        let mut total_us: u128 = 0;
        let mut prev_tick = 0_u64;
        let mut tempo = DEFAULT_TEMPO_US;
        for &(change_tick, change_tempo) in &self.changes {
            if change_tick > tick {
                break;
            }
            let span = change_tick - prev_tick;
            total_us += u128::from(span) * u128::from(tempo) / u128::from(self.ppq);
            prev_tick = change_tick;
            tempo = change_tempo;
        }
        total_us += u128::from(tick - prev_tick) * u128::from(tempo) / u128::from(self.ppq);
        (total_us * u128::from(rate) / 1_000_000) as u64
    }
}

fn convert(message: MidiMessage) -> (MidiEventKind, u8, u8) {
    match message {
        MidiMessage::NoteOff { key, vel } => (MidiEventKind::NoteOff, key.as_int(), vel.as_int()),
        MidiMessage::NoteOn { key, vel } => (MidiEventKind::NoteOn, key.as_int(), vel.as_int()),
        MidiMessage::Aftertouch { key, vel } => {
            (MidiEventKind::KeyPressure, key.as_int(), vel.as_int())
        }
        MidiMessage::Controller { controller, value } => {
            (MidiEventKind::Controller, controller.as_int(), value.as_int())
        }
        MidiMessage::ProgramChange { program } => (MidiEventKind::ProgramChange, program.as_int(), 0),
        MidiMessage::ChannelAftertouch { vel } => (MidiEventKind::ChannelPressure, vel.as_int(), 0),
        MidiMessage::PitchBend { bend } => {
            let raw = bend.0.as_int();
            (MidiEventKind::PitchBend, (raw & 0x7F) as u8, (raw >> 7) as u8)
        }
    }
}

/// Every channel event of every track, merged in time order and closed by
/// an end-of-track marker at the last event time.
pub fn parse_events(bytes: &[u8], rate: u32) -> Result<Vec<MidiEvent>, String> {
    let smf = Smf::parse(bytes).map_err(|e| e.to_string())?;
    let tempo = TempoMap::from_smf(&smf).ok_or("SMPTE timecode timing is not supported")?;
    let mut events = Vec::new();
    let mut end = 0_u64;
    for track in &smf.tracks {
        let mut tick = 0_u64;
        for event in track {
            tick = tick.saturating_add(u64::from(event.delta.as_int()));
            let time = tempo.samples(tick, rate);
            end = end.max(time);
            if let TrackEventKind::Midi { channel, message } = event.kind {
                let (kind, a, b) = convert(message);
                events.push(MidiEvent::new(time, kind, channel.as_int(), a, b));
            }
        }
    }
    // Stable: simultaneous events keep their track order.
    events.sort_by_key(|e| e.time);
    events.push(MidiEvent::new(end, MidiEventKind::EndOfTrack, 0, 0, 0));
    Ok(events)
}

pub fn load_events(path: &Path, rate: u32) -> Result<Vec<MidiEvent>, String> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read '{}': {e}", path.display()))?;
    parse_events(&bytes, rate).map_err(|e| format!("Failed to parse MIDI '{}': {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use midly::num::{u4, u7, u15, u24, u28};
    use midly::{Format, Header, TrackEvent};

    fn midi(delta: u32, channel: u8, message: MidiMessage) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Midi {
                channel: u4::new(channel),
                message,
            },
        }
    }

    fn tempo(delta: u32, us: u32) -> TrackEvent<'static> {
        TrackEvent {
            delta: u28::new(delta),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(us))),
        }
    }

    fn song() -> Vec<u8> {
        let track = vec![
            midi(0, 0, MidiMessage::ProgramChange { program: u7::new(5) }),
            midi(0, 0, MidiMessage::NoteOn { key: u7::new(60), vel: u7::new(100) }),
            // One beat at 120 bpm, then the tempo halves.
            tempo(480, 1_000_000),
            midi(0, 9, MidiMessage::NoteOn { key: u7::new(36), vel: u7::new(90) }),
            midi(480, 0, MidiMessage::NoteOff { key: u7::new(60), vel: u7::new(0) }),
            TrackEvent {
                delta: u28::new(0),
                kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
            },
        ];
        let smf = Smf {
            header: Header::new(Format::SingleTrack, Timing::Metrical(u15::new(480))),
            tracks: vec![track],
        };
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn tempo_changes_stretch_time() {
        let events = parse_events(&song(), 1_000).unwrap();
        let times: Vec<(MidiEventKind, u64)> = events.iter().map(|e| (e.kind, e.time)).collect();
        assert_eq!(
            times,
            vec![
                (MidiEventKind::ProgramChange, 0),
                (MidiEventKind::NoteOn, 0),
                (MidiEventKind::NoteOn, 500),
                (MidiEventKind::NoteOff, 1_500),
                (MidiEventKind::EndOfTrack, 1_500),
            ]
        );
        assert_eq!(events[2].channel, 9);
        assert_eq!((events[1].a, events[1].b), (60, 100));
    }

    #[test]
    fn pitch_bend_is_split_into_data_bytes() {
        let (kind, a, b) = convert(MidiMessage::PitchBend {
            bend: midly::PitchBend(midly::num::u14::new(0x2001)),
        });
        assert_eq!(kind, MidiEventKind::PitchBend);
        assert_eq!((a, b), (0x01, 0x40));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_events(b"not a midi file", 44_100).is_err());
    }
}
