use bitflags::bitflags;

bitflags! {
    /// Sample encoding of the PCM bytes handed to an output mode.
    ///
    /// Neither `BITS16` nor `BITS24` means 8-bit samples. `BYTESWAP` marks
    /// multi-byte samples stored in the opposite byte order to the host.
    /// `ULAW`/`ALAW` are companded 8-bit transports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Encoding: u32 {
        const MONO = 0x01;
        const SIGNED = 0x02;
        const BITS16 = 0x04;
        const ULAW = 0x08;
        const ALAW = 0x10;
        const BYTESWAP = 0x20;
        const BITS24 = 0x40;
    }
}

impl Encoding {
    /// Byte order flag that yields big-endian samples on this host.
    pub fn big_endian() -> Encoding {
        if cfg!(target_endian = "little") {
            Encoding::BYTESWAP
        } else {
            Encoding::empty()
        }
    }

    /// Byte order flag that yields little-endian samples on this host.
    pub fn little_endian() -> Encoding {
        if cfg!(target_endian = "big") {
            Encoding::BYTESWAP
        } else {
            Encoding::empty()
        }
    }

    pub fn validate(self, include: Encoding, exclude: Encoding) -> Encoding {
        let mut enc = (self | include) - exclude;
        if enc.intersects(Encoding::ULAW | Encoding::ALAW) {
            enc -= Encoding::BITS24 | Encoding::BITS16 | Encoding::SIGNED | Encoding::BYTESWAP;
            if enc.contains(Encoding::ULAW | Encoding::ALAW) {
                enc -= Encoding::ALAW;
            }
        }
        if !enc.intersects(Encoding::BITS16 | Encoding::BITS24) {
            enc -= Encoding::BYTESWAP;
        }
        if enc.contains(Encoding::BITS24) {
            enc -= Encoding::BITS16;
        }
        enc
    }

    pub fn bit_depth(self) -> u32 {
        if self.contains(Encoding::BITS24) {
            24
        } else if self.contains(Encoding::BITS16) {
            16
        } else {
            8
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        (self.bit_depth() / 8) as usize
    }

    pub fn channels(self) -> usize {
        if self.contains(Encoding::MONO) { 1 } else { 2 }
    }

    pub fn frame_bytes(self) -> usize {
        self.bytes_per_sample() * self.channels()
    }

    pub fn is_companded(self) -> bool {
        self.intersects(Encoding::ULAW | Encoding::ALAW)
    }

    pub fn is_big_endian(self) -> bool {
        if self.bytes_per_sample() == 1 {
            return false;
        }
        cfg!(target_endian = "big") != self.contains(Encoding::BYTESWAP)
    }

    pub fn describe(self) -> String {
        let body = if self.contains(Encoding::ULAW) {
            "U-law".to_string()
        } else if self.contains(Encoding::ALAW) {
            "A-law".to_string()
        } else {
            let sign = if self.contains(Encoding::SIGNED) {
                "signed"
            } else {
                "unsigned"
            };
            let order = if self.bytes_per_sample() > 1 {
                if self.is_big_endian() { " (BE)" } else { " (LE)" }
            } else {
                ""
            };
            format!("{}bit {sign} linear{order}", self.bit_depth())
        };
        let layout = if self.contains(Encoding::MONO) {
            "mono"
        } else {
            "stereo"
        };
        format!("{body}, {layout}")
    }
}

/// Number of extra integer parameters a backend may read from the format.
pub const EXTRA_PARAMS: usize = 5;

/// Rate and encoding requested from, and afterwards reported by, an output.
///
/// Callers fill this in before `open`; backends overwrite it with what the
/// device actually accepted, so it must be read back after `open` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackFormat {
    pub encoding: Encoding,
    pub rate: u32,
    pub extra_param: [i32; EXTRA_PARAMS],
}

impl Default for PlaybackFormat {
    fn default() -> Self {
        Self {
            encoding: Encoding::SIGNED | Encoding::BITS16,
            rate: 44_100,
            extra_param: [0; EXTRA_PARAMS],
        }
    }
}

impl PlaybackFormat {
    pub fn new(rate: u32, encoding: Encoding) -> Self {
        Self {
            encoding,
            rate,
            ..Self::default()
        }
    }

    pub fn channels(&self) -> usize {
        self.encoding.channels()
    }

    pub fn frame_bytes(&self) -> usize {
        self.encoding.frame_bytes()
    }

    pub fn bytes_to_frames(&self, bytes: usize) -> usize {
        bytes / self.frame_bytes().max(1)
    }

    pub fn frames_to_bytes(&self, frames: usize) -> usize {
        frames.saturating_mul(self.frame_bytes())
    }
}
