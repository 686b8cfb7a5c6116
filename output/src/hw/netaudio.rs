//! Network audio-server output.
//!
//! A control connection negotiates the stream:
//!
//! ```text
//! -> OPEN <rate> <channels> <lin16|ulaw|alaw> <internal|external>
//! <- OK <data-port>        or   ERR <message>
//! ```
//!
//! PCM then goes verbatim to a second connection on the announced port.
//! `CLOSE` ends the session. The server cannot drop queued audio, so
//! discarding is unsupported.

use crate::config::NetAudioConfig;
use crate::error::{OutputError, op_failed, open_failed};
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::{ControlReply, ControlRequest, ModeCore, ModeFlags, OpenStatus, PlayMode};
use crate::negotiate::force_encoding;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, error};

const LABEL: &str = "netaudio";
const DETECT_TIMEOUT: Duration = Duration::from_millis(250);

fn stream_token(encoding: Encoding) -> &'static str {
    if encoding.contains(Encoding::ULAW) {
        "ulaw"
    } else if encoding.contains(Encoding::ALAW) {
        "alaw"
    } else {
        "lin16"
    }
}

struct Session {
    control: BufReader<TcpStream>,
    data: TcpStream,
}

impl Session {
    fn connect(config: &NetAudioConfig, format: &PlaybackFormat) -> Result<Self, String> {
        let stream = TcpStream::connect(config.server.as_str()).map_err(|e| e.to_string())?;
        let peer = stream.peer_addr().map_err(|e| e.to_string())?;
        let mut control = BufReader::new(stream);
        let request = format!(
            "OPEN {} {} {} {}\n",
            format.rate,
            format.channels(),
            stream_token(format.encoding),
            config.speaker.as_str()
        );
        control
            .get_mut()
            .write_all(request.as_bytes())
            .map_err(|e| e.to_string())?;

        let mut reply = String::new();
        control.read_line(&mut reply).map_err(|e| e.to_string())?;
        let reply = reply.trim();
        let port = match reply.split_once(' ') {
            Some(("OK", port)) => port
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("bad data port in reply '{reply}'"))?,
            Some(("ERR", message)) => return Err(message.trim().to_string()),
            _ if reply.is_empty() => return Err("server closed the connection".to_string()),
            _ => return Err(format!("unexpected reply '{reply}'")),
        };
        let data = TcpStream::connect(SocketAddr::new(peer.ip(), port)).map_err(|e| e.to_string())?;
        Ok(Self { control, data })
    }

    fn finish(mut self) {
        let _ = self.data.shutdown(Shutdown::Write);
        if let Err(e) = self.control.get_mut().write_all(b"CLOSE\n") {
            debug!("{}", op_failed(LABEL, "CLOSE", e));
        }
        let _ = self.control.get_ref().shutdown(Shutdown::Both);
    }
}

pub struct NetAudioMode {
    core: ModeCore,
    config: NetAudioConfig,
    session: Option<Session>,
}

impl NetAudioMode {
    pub fn new(config: NetAudioConfig) -> Self {
        Self {
            core: ModeCore::new('N', "network audio server", ModeFlags::PCM_STREAM),
            config,
            session: None,
        }
    }

    pub fn config(&self) -> &NetAudioConfig {
        &self.config
    }
}

impl PlayMode for NetAudioMode {
    fn core(&self) -> &ModeCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModeCore {
        &mut self.core
    }

    fn open(&mut self) -> Result<OpenStatus, OutputError> {
        self.close();
        // The server speaks µ-law, A-law or big-endian signed 16-bit.
        let status = if self.core.format.encoding.is_companded() {
            force_encoding(LABEL, &mut self.core.format, Encoding::empty(), Encoding::empty())
        } else {
            force_encoding(
                LABEL,
                &mut self.core.format,
                Encoding::BITS16 | Encoding::SIGNED | Encoding::big_endian(),
                Encoding::BITS24,
            )
        };
        let session = Session::connect(&self.config, &self.core.format).map_err(|e| {
            let message = open_failed(LABEL, &format!("server {}", self.config.server), e);
            error!("{message}");
            OutputError::Device(message)
        })?;
        debug!(
            "{LABEL}: streaming {} at {} Hz to {} ({} speaker)",
            self.core.format.encoding.describe(),
            self.core.format.rate,
            self.config.server,
            self.config.speaker.as_str()
        );
        self.session = Some(session);
        Ok(status)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, OutputError> {
        let session = self.session.as_mut().ok_or(OutputError::NotOpen)?;
        session.data.write_all(buf).map_err(|e| {
            let message = op_failed(LABEL, "send", e);
            error!("{message}");
            OutputError::Device(message)
        })?;
        Ok(buf.len())
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.finish();
        }
    }

    fn control(&mut self, request: ControlRequest) -> Result<ControlReply, OutputError> {
        match request {
            ControlRequest::Flush | ControlRequest::PlayStart(_) | ControlRequest::PlayEnd => {
                Ok(ControlReply::Done)
            }
            _ => Err(OutputError::Unsupported),
        }
    }

    fn is_open(&self) -> bool {
        self.session.is_some()
    }

    fn detect(&self) -> bool {
        let Ok(addrs) = self.config.server.to_socket_addrs() else {
            return false;
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, DETECT_TIMEOUT).is_ok())
    }
}
