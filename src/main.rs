mod logging;
mod midi;
mod source;

use clap::builder::{PossibleValuesParser, TypedValueParser};
use clap::{ArgAction, Parser};
use playmode_output::{
    ControlRequest, Encoding, FileInfo, ModeFlags, OpenStatus, OutputConfig, OutputError,
    PlayMode, PlaybackFormat, find_mode, mode_list, write_all,
};
use source::PcmSource;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info, warn};

/// Device modes tried in order when no mode is requested.
const DEVICE_MODES: [char; 3] = ['s', 'd', 'N'];
const FALLBACK_MODE: char = 'r';
const CHUNK_FRAMES: usize = 4096;

#[derive(Debug, Parser)]
#[command(name = "playmode", version, about = "Play WAV and MIDI files through an output mode")]
struct Cli {
    /// Output mode id (see --list-modes).
    #[arg(short = 'o', long = "mode")]
    mode: Option<char>,

    /// Output file name; `-` is stdout. File modes name files per input without it.
    #[arg(short = 'O', long = "output")]
    output: Option<String>,

    /// Sample rate in Hz; defaults to the first WAV input's rate.
    #[arg(short = 's', long = "rate")]
    rate: Option<u32>,

    #[arg(long, default_value_t = 16, value_parser = PossibleValuesParser::new(["8", "16", "24"]).map(|s| s.parse::<u32>().unwrap_or(16)))]
    bits: u32,

    #[arg(long)]
    unsigned: bool,

    #[arg(long)]
    mono: bool,

    #[arg(long, conflicts_with = "alaw")]
    ulaw: bool,

    #[arg(long)]
    alaw: bool,

    /// TOML file with per-backend settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[arg(long)]
    list_modes: bool,

    inputs: Vec<PathBuf>,
}

impl Cli {
    fn encoding(&self) -> Encoding {
        let mut enc = match self.bits {
            8 => Encoding::empty(),
            24 => Encoding::BITS24,
            _ => Encoding::BITS16,
        };
        if !self.unsigned {
            enc |= Encoding::SIGNED;
        }
        if self.mono {
            enc |= Encoding::MONO;
        }
        if self.ulaw {
            enc |= Encoding::ULAW;
        } else if self.alaw {
            enc |= Encoding::ALAW;
        }
        enc.validate(Encoding::empty(), Encoding::empty())
    }
}

fn load_config(path: Option<&Path>) -> Result<OutputConfig, String> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|e| format!("Failed to read config '{}': {e}", path.display()))?;
            toml::from_str(&text)
                .map_err(|e| format!("Failed to parse config '{}': {e}", path.display()))?
        }
        None => OutputConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn print_modes(config: &OutputConfig) {
    for mode in mode_list(config) {
        let info = mode.info();
        let state = if mode.detect() { "" } else { " (not detected)" };
        println!("  -o {}  {}{state}", info.id, info.name);
    }
}

fn select_mode(id: Option<char>, config: &OutputConfig) -> Result<Box<dyn PlayMode>, String> {
    if let Some(id) = id {
        return find_mode(id, config).ok_or_else(|| format!("Unknown output mode '{id}'"));
    }
    for id in DEVICE_MODES {
        if let Some(mode) = find_mode(id, config)
            && mode.detect()
        {
            return Ok(mode);
        }
    }
    info!("no playback device detected, writing raw output");
    find_mode(FALLBACK_MODE, config).ok_or_else(|| "No output mode available".to_string())
}

fn is_midi(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "mid" | "midi" | "smf"))
}

/// Sends a session event; modes without a use for it are fine.
fn notify(mode: &mut dyn PlayMode, request: ControlRequest) -> Result<(), String> {
    match mode.control(request) {
        Ok(_) => Ok(()),
        Err(OutputError::Unsupported) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

fn play_wav(mode: &mut dyn PlayMode, path: &Path) -> Result<(), String> {
    let source = PcmSource::open(path)?;
    if source.rate != mode.rate() {
        warn!(
            "{}: {} Hz input played at {} Hz",
            path.display(),
            source.rate,
            mode.rate()
        );
    }
    let format = mode.format();
    let mut frame = 0;
    while frame < source.frames() {
        let pcm = source.encode(frame, CHUNK_FRAMES, &format);
        write_all(mode, &pcm).map_err(|e| e.to_string())?;
        frame += CHUNK_FRAMES;
    }
    debug!("{}: {} frames", path.display(), source.frames());
    Ok(())
}

fn play_midi(mode: &mut dyn PlayMode, path: &Path) -> Result<(), String> {
    if !mode.info().flags.contains(ModeFlags::MIDI_EVENT) {
        warn!(
            "{}: {} does not take MIDI events, skipping",
            path.display(),
            mode.info().name
        );
        return Ok(());
    }
    let events = midi::load_events(path, mode.rate())?;
    debug!("{}: {} events", path.display(), events.len());
    for event in events {
        notify(mode, ControlRequest::Midi(event))?;
    }
    Ok(())
}

fn play(mode: &mut dyn PlayMode, inputs: &[PathBuf]) -> Result<(), String> {
    for input in inputs {
        notify(mode, ControlRequest::PlayStart(FileInfo::new(input.display().to_string())))?;
        let played = if is_midi(input) {
            play_midi(mode, input)
        } else {
            play_wav(mode, input)
        };
        if let Err(e) = played {
            error!("{e}");
            if let Err(e) = notify(mode, ControlRequest::Discard) {
                warn!("{}: discard failed: {e}", input.display());
            }
        }
        notify(mode, ControlRequest::PlayEnd)?;
    }
    Ok(())
}

fn run(cli: Cli) -> Result<(), String> {
    let config = load_config(cli.config.as_deref())?;
    if cli.list_modes {
        print_modes(&config);
        return Ok(());
    }
    if cli.inputs.is_empty() {
        return Err("No input files".to_string());
    }

    let rate = match cli.rate {
        Some(rate) => rate,
        None => cli
            .inputs
            .iter()
            .find(|p| !is_midi(p))
            .and_then(|p| PcmSource::open(p).ok())
            .map_or(PlaybackFormat::default().rate, |s| s.rate),
    };

    let mut mode = select_mode(cli.mode, &config)?;
    mode.set_output_name(cli.output.clone());
    mode.set_format(PlaybackFormat::new(rate, cli.encoding()));
    match mode.open().map_err(|e| e.to_string())? {
        OpenStatus::Exact => {}
        OpenStatus::Adjusted => info!(
            "{}: playing as {} at {} Hz",
            mode.info().name,
            mode.encoding().describe(),
            mode.rate()
        ),
    }
    let result = play(mode.as_mut(), &cli.inputs);
    mode.close();
    result
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("{e}");
    }
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("playmode: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_build_encodings() {
        let cli = Cli::parse_from(["playmode", "--bits", "8", "--unsigned", "--mono", "x.wav"]);
        assert_eq!(cli.encoding(), Encoding::MONO);
        let cli = Cli::parse_from(["playmode", "--bits", "24", "x.wav"]);
        assert_eq!(cli.encoding(), Encoding::BITS24 | Encoding::SIGNED);
        let cli = Cli::parse_from(["playmode", "--ulaw", "x.wav"]);
        assert_eq!(cli.encoding(), Encoding::ULAW);
    }

    #[test]
    fn companding_flags_conflict() {
        assert!(Cli::try_parse_from(["playmode", "--ulaw", "--alaw", "x.wav"]).is_err());
        assert!(Cli::try_parse_from(["playmode", "--bits", "12", "x.wav"]).is_err());
    }

    #[test]
    fn midi_inputs_by_extension() {
        assert!(is_midi(Path::new("song.MID")));
        assert!(is_midi(Path::new("a/b.midi")));
        assert!(!is_midi(Path::new("take.wav")));
    }

    #[test]
    fn wav_through_raw_mode() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("in.wav");
        wavers::write::<i16, _>(&wav, &[256, 512, -1, 1], 8_000, 2).unwrap();
        let out = dir.path().join("out.raw");

        let config = OutputConfig::default();
        let mut mode = find_mode('r', &config).unwrap();
        mode.set_output_name(Some(out.display().to_string()));
        mode.set_format(PlaybackFormat::new(8_000, Encoding::BITS16 | Encoding::SIGNED));
        mode.open().unwrap();
        play(mode.as_mut(), &[wav]).unwrap();
        mode.close();
        assert_eq!(
            fs::read(&out).unwrap(),
            vec![0x00, 0x01, 0x00, 0x02, 0xFF, 0xFF, 0x01, 0x00]
        );
    }

    /// Records session events and refuses to discard.
    struct Stubborn {
        core: playmode_output::mode::ModeCore,
        events: Vec<&'static str>,
    }

    impl PlayMode for Stubborn {
        fn core(&self) -> &playmode_output::mode::ModeCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut playmode_output::mode::ModeCore {
            &mut self.core
        }

        fn open(&mut self) -> Result<OpenStatus, OutputError> {
            Ok(OpenStatus::Exact)
        }

        fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
            Ok(buf.len())
        }

        fn close(&mut self) {}

        fn control(
            &mut self,
            request: ControlRequest,
        ) -> Result<playmode_output::ControlReply, OutputError> {
            match request {
                ControlRequest::PlayStart(_) => self.events.push("start"),
                ControlRequest::PlayEnd => self.events.push("end"),
                ControlRequest::Discard => {
                    self.events.push("discard");
                    return Err(OutputError::Device("device gone".to_string()));
                }
                _ => return Err(OutputError::Unsupported),
            }
            Ok(playmode_output::ControlReply::Done)
        }

        fn is_open(&self) -> bool {
            true
        }
    }

    #[test]
    fn failed_discard_does_not_stop_playback() {
        let dir = tempfile::tempdir().unwrap();
        let mut mode = Stubborn {
            core: playmode_output::mode::ModeCore::new('z', "stubborn", ModeFlags::PCM_STREAM),
            events: Vec::new(),
        };
        let missing = dir.path().join("missing.wav");
        play(&mut mode, &[missing.clone(), missing]).unwrap();
        assert_eq!(
            mode.events,
            vec!["start", "discard", "end", "start", "discard", "end"]
        );
    }

    #[test]
    fn config_file_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playmode.toml");
        fs::write(
            &path,
            "[alsa]\ndevice = \"hw:1,0\"\n[vorbis]\nbitrate = 128000\nquality = 0.6\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.vorbis.bitrate, Some(128_000));
        assert_eq!(config.vorbis.quality, Some(0.6));
        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
