//! Headerless PCM written exactly as received.

use super::OutputFile;
use super::encoder::{EncoderMode, StreamEncoder};
use crate::config::OutputConfig;
use crate::error::OutputError;
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::OpenStatus;
use crate::negotiate::force_encoding;
use std::io::Write;

pub type RawMode = EncoderMode<RawFile>;

/// Extension naming the sample layout: `.ul` for µ-law, `.raw` for A-law,
/// otherwise signedness (`s`/`u`) followed by width (`b`, `w`, `24`).
pub fn raw_extension(encoding: Encoding) -> String {
    if encoding.contains(Encoding::ULAW) {
        return ".ul".to_string();
    }
    if encoding.contains(Encoding::ALAW) {
        return ".raw".to_string();
    }
    let sign = if encoding.contains(Encoding::SIGNED) {
        's'
    } else {
        'u'
    };
    let width = match encoding.bit_depth() {
        24 => "24",
        16 => "w",
        _ => "b",
    };
    format!(".{sign}{width}")
}

pub struct RawFile {
    out: OutputFile,
    path: String,
    bytes: u64,
}

impl StreamEncoder for RawFile {
    const ID: char = 'r';
    const DESCRIPTION: &'static str = "Raw waveform data";
    const LABEL: &'static str = "raw";
    const SUMMARY: bool = false;

    type Settings = ();

    fn settings(_config: &OutputConfig) {}

    fn negotiate(format: &mut PlaybackFormat) -> OpenStatus {
        force_encoding(Self::LABEL, format, Encoding::empty(), Encoding::empty())
    }

    fn extension(encoding: Encoding) -> String {
        raw_extension(encoding)
    }

    fn start(
        out: OutputFile,
        path: &str,
        _format: &PlaybackFormat,
        _settings: &(),
    ) -> Result<Self, OutputError> {
        Ok(Self {
            out,
            path: path.to_string(),
            bytes: 0,
        })
    }

    fn encode(&mut self, pcm: &[u8]) -> Result<(), OutputError> {
        self.out
            .write_all(pcm)
            .map_err(|e| OutputError::io(self.path.as_str(), e))?;
        self.bytes += pcm.len() as u64;
        Ok(())
    }

    fn finish(mut self) -> Result<u64, OutputError> {
        self.out
            .flush()
            .map_err(|e| OutputError::io(self.path.as_str(), e))?;
        Ok(self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{ControlRequest, FileInfo, PlayMode};

    #[test]
    fn extension_per_encoding() {
        let cases = [
            (Encoding::ULAW, ".ul"),
            (Encoding::ALAW, ".raw"),
            (Encoding::BITS16 | Encoding::SIGNED, ".sw"),
            (Encoding::BITS16, ".uw"),
            (Encoding::BITS24 | Encoding::SIGNED, ".s24"),
            (Encoding::BITS24, ".u24"),
            (Encoding::SIGNED | Encoding::MONO, ".sb"),
            (Encoding::empty(), ".ub"),
        ];
        for (enc, ext) in cases {
            assert_eq!(raw_extension(enc), ext, "{}", enc.describe());
        }
    }

    #[test]
    fn bytes_pass_through_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.raw");
        let mut mode = RawMode::new(());
        mode.set_format(PlaybackFormat::new(
            44_100,
            Encoding::BITS16 | Encoding::SIGNED,
        ));
        mode.set_output_name(Some(path.to_string_lossy().into_owned()));
        assert_eq!(mode.open().unwrap(), OpenStatus::Exact);
        assert_eq!(mode.write(&[0x00, 0x01, 0x00, 0x02]).unwrap(), 4);
        mode.close();
        assert_eq!(std::fs::read(&path).unwrap(), vec![0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn auto_split_names_by_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = OutputConfig::default();
        config.output_dir = Some(dir.path().to_path_buf());
        let mut mode = RawMode::from_config(&config);
        mode.set_format(PlaybackFormat::new(8_000, Encoding::ULAW | Encoding::MONO));
        mode.open().unwrap();
        mode.control(ControlRequest::PlayStart(FileInfo::new("songs/tune.mid")))
            .unwrap();
        mode.write(&[0xFF; 10]).unwrap();
        mode.control(ControlRequest::PlayEnd).unwrap();
        mode.close();
        assert_eq!(std::fs::read(dir.path().join("tune.ul")).unwrap(), vec![0xFF; 10]);
    }
}
