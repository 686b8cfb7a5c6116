pub mod aiff;
pub mod encoder;
pub mod flac;
mod ieee80;
pub mod raw;
#[cfg(feature = "speex")]
pub mod speex;
#[cfg(feature = "vorbis")]
pub mod vorbis;

use crate::error::OutputError;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Stdout, Write};
use std::path::Path;

/// Destination of a file-backed mode: a regular file, or stdout for `-`.
#[derive(Debug)]
pub enum OutputFile {
    File(BufWriter<File>),
    Stdout(Stdout),
}

impl OutputFile {
    pub fn create(name: &str) -> Result<Self, OutputError> {
        if name == "-" {
            return Ok(OutputFile::Stdout(io::stdout()));
        }
        let file = File::create(name).map_err(|e| OutputError::io(name, e))?;
        Ok(OutputFile::File(BufWriter::new(file)))
    }
}

impl Write for OutputFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutputFile::File(f) => f.write(buf),
            OutputFile::Stdout(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            OutputFile::File(f) => f.flush(),
            OutputFile::Stdout(s) => s.flush(),
        }
    }
}

impl Seek for OutputFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            OutputFile::File(f) => f.seek(pos),
            OutputFile::Stdout(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "stdout is not seekable",
            )),
        }
    }
}

/// Write adapter that counts the bytes passed through it.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
    eager: bool,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            count: 0,
            eager: false,
        }
    }

    /// Flushes the inner writer after every write, so pages handed over by
    /// an encoder that owns its sink reach the file as they are emitted.
    pub fn flushing(inner: W) -> Self {
        Self {
            eager: true,
            ..Self::new(inner)
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        if self.eager {
            self.inner.flush()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Derives an output file name from an input file name.
///
/// The extension of the last path component is replaced by `ext` (which
/// includes its dot). With `output_dir` the file lands there, either under
/// its base name or, when `flatten` is set, under the whole input path with
/// directory separators turned into `_`.
pub fn auto_output_name(input: &str, ext: &str, output_dir: Option<&Path>, flatten: bool) -> String {
    let input = if input == "-" { "stdin" } else { input };
    let stem_source = match output_dir {
        Some(_) if flatten => input
            .trim_start_matches(['/', '\\'])
            .replace(['/', '\\'], "_"),
        Some(_) => input
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(input)
            .to_string(),
        None => input.to_string(),
    };

    let name_start = stem_source
        .rfind(['/', '\\'])
        .map_or(0, |idx| idx + 1);
    let stem = match stem_source[name_start..].rfind('.') {
        Some(dot) if dot > 0 => &stem_source[..name_start + dot],
        _ => stem_source.as_str(),
    };
    let file_name = format!("{stem}{ext}");
    match output_dir {
        Some(dir) => dir.join(file_name).to_string_lossy().into_owned(),
        None => file_name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn replaces_extension_in_place() {
        assert_eq!(auto_output_name("songs/a.mid", ".flac", None, false), "songs/a.flac");
        assert_eq!(auto_output_name("noext", ".aiff", None, false), "noext.aiff");
        assert_eq!(auto_output_name("dir.v2/track", ".ogg", None, false), "dir.v2/track.ogg");
    }

    #[test]
    fn hidden_file_keeps_its_name() {
        assert_eq!(auto_output_name(".mid", ".raw", None, false), ".mid.raw");
    }

    #[test]
    fn output_dir_uses_base_name() {
        let dir = PathBuf::from("/tmp/out");
        let name = auto_output_name("/music/x/y.mid", ".spx", Some(&dir), false);
        assert_eq!(PathBuf::from(name), dir.join("y.spx"));
    }

    #[test]
    fn flatten_sanitizes_separators() {
        let dir = PathBuf::from("out");
        let name = auto_output_name("/music/x/y.mid", ".ogg", Some(&dir), true);
        assert_eq!(PathBuf::from(name), dir.join("music_x_y.ogg"));
    }

    #[test]
    fn stdin_gets_a_name() {
        assert_eq!(auto_output_name("-", ".sw", None, false), "stdin.sw");
    }

    #[test]
    fn counting_writer_counts() {
        let mut w = CountingWriter::new(Vec::new());
        w.write_all(b"abcdef").unwrap();
        assert_eq!(w.count(), 6);
        assert_eq!(w.into_inner(), b"abcdef");
    }

    #[test]
    fn flushing_writer_empties_the_buffer() {
        let mut w = CountingWriter::flushing(BufWriter::new(Vec::new()));
        w.write_all(b"OggS").unwrap();
        let inner = w.into_inner();
        assert!(inner.buffer().is_empty());
        assert_eq!(inner.get_ref(), b"OggS");
    }
}
