//! Session handling shared by every file-writing mode.
//!
//! A [`StreamEncoder`] knows one container format; [`EncoderMode`] wraps it in
//! the PlayMode contract, owns at most one live session and opens a fresh one
//! per input file when no explicit output name was given.

use super::{OutputFile, auto_output_name};
use crate::config::OutputConfig;
use crate::error::OutputError;
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::{ControlReply, ControlRequest, ModeCore, ModeFlags, OpenStatus, PlayMode};
use crate::negotiate::force_encoding;
use std::path::PathBuf;
use tracing::{debug, error, info};

pub trait StreamEncoder: Sized + Send {
    const ID: char;
    const DESCRIPTION: &'static str;
    const LABEL: &'static str;
    /// Whether closing a session reports a compression ratio.
    const SUMMARY: bool = true;

    type Settings: Clone + Send;

    fn settings(config: &OutputConfig) -> Self::Settings;

    /// Rewrites the requested format into one the encoder accepts.
    fn negotiate(format: &mut PlaybackFormat) -> OpenStatus;

    /// File extension, dot included, for auto-split output names.
    fn extension(encoding: Encoding) -> String;

    /// Creates the session and writes any container headers.
    fn start(
        out: OutputFile,
        path: &str,
        format: &PlaybackFormat,
        settings: &Self::Settings,
    ) -> Result<Self, OutputError>;

    fn encode(&mut self, pcm: &[u8]) -> Result<(), OutputError>;

    /// Flushes the tail and returns the number of bytes in the output file.
    fn finish(self) -> Result<u64, OutputError>;
}

/// Negotiation for encoders that only take native-endian signed 16-bit PCM.
pub fn negotiate_pcm16(label: &str, format: &mut PlaybackFormat) -> OpenStatus {
    force_encoding(
        label,
        format,
        Encoding::BITS16 | Encoding::SIGNED,
        Encoding::BITS24 | Encoding::ULAW | Encoding::ALAW | Encoding::BYTESWAP,
    )
}

/// Splits a byte stream into native-endian i16 samples, carrying a trailing
/// odd byte over to the next call.
#[derive(Debug, Default)]
pub struct Pcm16Splitter {
    carry: Option<u8>,
}

impl Pcm16Splitter {
    pub fn split(&mut self, pcm: &[u8], out: &mut Vec<i16>) {
        let mut bytes = pcm;
        if let Some(first) = self.carry.take() {
            let Some((&second, rest)) = bytes.split_first() else {
                self.carry = Some(first);
                return;
            };
            out.push(i16::from_ne_bytes([first, second]));
            bytes = rest;
        }
        let mut chunks = bytes.chunks_exact(2);
        out.extend(chunks.by_ref().map(|c| i16::from_ne_bytes([c[0], c[1]])));
        self.carry = chunks.remainder().first().copied();
    }
}

struct Session<E> {
    encoder: E,
    path: String,
    in_bytes: u64,
}

pub struct EncoderMode<E: StreamEncoder> {
    core: ModeCore,
    settings: E::Settings,
    output_dir: Option<PathBuf>,
    flatten: bool,
    open: bool,
    session: Option<Session<E>>,
}

impl<E: StreamEncoder> EncoderMode<E> {
    pub fn new(settings: E::Settings) -> Self {
        Self {
            core: ModeCore::new(
                E::ID,
                E::DESCRIPTION,
                ModeFlags::PCM_STREAM | ModeFlags::FILE_OUTPUT | ModeFlags::AUTO_SPLIT_FILE,
            ),
            settings,
            output_dir: None,
            flatten: false,
            open: false,
            session: None,
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        let mut mode = Self::new(E::settings(config));
        mode.output_dir = config.output_dir.clone();
        mode.flatten = config.flatten_auto_names;
        mode
    }

    pub fn settings(&self) -> &E::Settings {
        &self.settings
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn auto_split(&self) -> bool {
        self.core.name.is_none()
    }

    fn start_session(&mut self, path: String) -> Result<(), OutputError> {
        self.finish_session();
        let out = OutputFile::create(&path)?;
        let encoder = E::start(out, &path, &self.core.format, &self.settings)?;
        info!("{} output: {path}", E::LABEL);
        self.session = Some(Session {
            encoder,
            path,
            in_bytes: 0,
        });
        Ok(())
    }

    fn finish_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Session {
            encoder,
            path,
            in_bytes,
        } = session;
        match encoder.finish() {
            Ok(out_bytes) if E::SUMMARY => {
                let ratio = if in_bytes == 0 {
                    0
                } else {
                    out_bytes * 100 / in_bytes
                };
                info!("{path}: wrote {in_bytes} bytes, encoded {out_bytes} bytes ({ratio}%)");
            }
            Ok(out_bytes) => info!("{path}: closed after {out_bytes} bytes"),
            Err(e) => error!("{e}"),
        }
    }
}

impl<E: StreamEncoder> PlayMode for EncoderMode<E> {
    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn open(&mut self) -> Result<OpenStatus, OutputError> {
        self.close();
        let status = E::negotiate(&mut self.core.format);
        if let Some(name) = self.core.name.clone() {
            self.start_session(name)?;
        }
        self.open = true;
        Ok(status)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
        if !self.open {
            return Err(OutputError::NotOpen);
        }
        let Some(session) = self.session.as_mut() else {
            debug!("{}: no session, dropping {} bytes", E::LABEL, buf.len());
            return Ok(buf.len());
        };
        session.encoder.encode(buf)?;
        session.in_bytes += buf.len() as u64;
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.finish_session();
        self.open = false;
    }

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError> {
        match request {
            ControlRequest::PlayStart(file) => {
                if self.open && self.auto_split() {
                    let path = auto_output_name(
                        &file.filename,
                        &E::extension(self.core.format.encoding),
                        self.output_dir.as_deref(),
                        self.flatten,
                    );
                    self.start_session(path)?;
                }
                Ok(ControlReply::Done)
            }
            ControlRequest::PlayEnd => {
                if self.auto_split() {
                    self.finish_session();
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
