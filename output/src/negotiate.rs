use crate::error::OutputError;
use crate::format::{Encoding, PlaybackFormat};
use crate::mode::OpenStatus;
use tracing::warn;

/// A concrete device sample format, as probed against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S8,
    U8,
    S16Le,
    S16Be,
    U16Le,
    U16Be,
    S24Le,
    S24Be,
    U24Le,
    U24Be,
    MuLaw,
    ALaw,
}

impl SampleFormat {
    pub fn linear(bits: u32, signed: bool, big_endian: bool) -> SampleFormat {
        match (bits, signed, big_endian) {
            (24, true, false) => SampleFormat::S24Le,
            (24, true, true) => SampleFormat::S24Be,
            (24, false, false) => SampleFormat::U24Le,
            (24, false, true) => SampleFormat::U24Be,
            (16, true, false) => SampleFormat::S16Le,
            (16, true, true) => SampleFormat::S16Be,
            (16, false, false) => SampleFormat::U16Le,
            (16, false, true) => SampleFormat::U16Be,
            (_, true, _) => SampleFormat::S8,
            (_, false, _) => SampleFormat::U8,
        }
    }

    pub fn from_encoding(enc: Encoding) -> SampleFormat {
        if enc.contains(Encoding::ULAW) {
            return SampleFormat::MuLaw;
        }
        if enc.contains(Encoding::ALAW) {
            return SampleFormat::ALaw;
        }
        SampleFormat::linear(
            enc.bit_depth(),
            enc.contains(Encoding::SIGNED),
            enc.is_big_endian(),
        )
    }

    /// Encoding flags for this format, without the channel layout.
    pub fn encoding(self) -> Encoding {
        let be = Encoding::big_endian();
        let le = Encoding::little_endian();
        match self {
            SampleFormat::S8 => Encoding::SIGNED,
            SampleFormat::U8 => Encoding::empty(),
            SampleFormat::S16Le => Encoding::BITS16 | Encoding::SIGNED | le,
            SampleFormat::S16Be => Encoding::BITS16 | Encoding::SIGNED | be,
            SampleFormat::U16Le => Encoding::BITS16 | le,
            SampleFormat::U16Be => Encoding::BITS16 | be,
            SampleFormat::S24Le => Encoding::BITS24 | Encoding::SIGNED | le,
            SampleFormat::S24Be => Encoding::BITS24 | Encoding::SIGNED | be,
            SampleFormat::U24Le => Encoding::BITS24 | le,
            SampleFormat::U24Be => Encoding::BITS24 | be,
            SampleFormat::MuLaw => Encoding::ULAW,
            SampleFormat::ALaw => Encoding::ALAW,
        }
    }

    pub fn bit_depth(self) -> u32 {
        self.encoding().bit_depth()
    }
}

/// Probe order for a requested encoding.
///
/// The exact request comes first, then for each depth not above the request:
/// native-endian signed, native-endian unsigned, foreign-endian signed,
/// foreign-endian unsigned. Companded requests fall back to 8-bit linear only.
pub fn sample_format_candidates(requested: Encoding) -> Vec<SampleFormat> {
    let native_be = cfg!(target_endian = "big");
    let mut candidates = Vec::with_capacity(10);
    fn push(candidates: &mut Vec<SampleFormat>, fmt: SampleFormat) {
        if !candidates.contains(&fmt) {
            candidates.push(fmt);
        }
    }

    push(&mut candidates, SampleFormat::from_encoding(requested));
    if requested.is_companded() {
        let (first, second) = if requested.contains(Encoding::SIGNED) {
            (SampleFormat::S8, SampleFormat::U8)
        } else {
            (SampleFormat::U8, SampleFormat::S8)
        };
        push(&mut candidates, first);
        push(&mut candidates, second);
        return candidates;
    }

    let depths: &[u32] = match requested.bit_depth() {
        24 => &[24, 16, 8],
        16 => &[16, 8],
        _ => &[8],
    };
    for &bits in depths {
        if bits == 8 {
            let (first, second) = if requested.contains(Encoding::SIGNED) {
                (SampleFormat::S8, SampleFormat::U8)
            } else {
                (SampleFormat::U8, SampleFormat::S8)
            };
            push(&mut candidates, first);
            push(&mut candidates, second);
            continue;
        }
        push(&mut candidates, SampleFormat::linear(bits, true, native_be));
        push(&mut candidates, SampleFormat::linear(bits, false, native_be));
        push(&mut candidates, SampleFormat::linear(bits, true, !native_be));
        push(&mut candidates, SampleFormat::linear(bits, false, !native_be));
    }
    candidates
}

/// Returns the first candidate the probe accepts.
pub fn pick_format(
    label: &str,
    requested: Encoding,
    mut probe: impl FnMut(SampleFormat) -> bool,
) -> Result<SampleFormat, OutputError> {
    let candidates = sample_format_candidates(requested);
    candidates
        .iter()
        .copied()
        .find(|fmt| probe(*fmt))
        .ok_or_else(|| {
            OutputError::Format(format!(
                "{label} supports none of {candidates:?} (requested {})",
                requested.describe()
            ))
        })
}

/// Builds the negotiated format from what the device accepted and reports
/// every difference from the request as a warning.
pub fn settle(
    label: &str,
    requested: &PlaybackFormat,
    sample: SampleFormat,
    channels: usize,
    rate: u32,
) -> Result<(PlaybackFormat, OpenStatus), OutputError> {
    let layout = match channels {
        1 => Encoding::MONO,
        2 => Encoding::empty(),
        n => {
            return Err(OutputError::Format(format!(
                "{label} only offers {n} channels"
            )));
        }
    };
    let format = PlaybackFormat {
        encoding: sample.encoding() | layout,
        rate,
        extra_param: requested.extra_param,
    };
    Ok((format, report(label, requested, &format)))
}

/// Forces encoding flags a backend requires or cannot represent.
pub fn force_encoding(
    label: &str,
    format: &mut PlaybackFormat,
    include: Encoding,
    exclude: Encoding,
) -> OpenStatus {
    let requested = *format;
    format.encoding = format.encoding.validate(include, exclude);
    report(label, &requested, format)
}

fn report(label: &str, requested: &PlaybackFormat, actual: &PlaybackFormat) -> OpenStatus {
    let mut status = OpenStatus::Exact;
    if actual.encoding != requested.encoding {
        warn!(
            "{label}: encoding {} substituted for {}",
            actual.encoding.describe(),
            requested.encoding.describe()
        );
        status = OpenStatus::Adjusted;
    }
    if actual.rate != requested.rate {
        warn!(
            "{label}: sample rate {} Hz substituted for {} Hz",
            actual.rate, requested.rate
        );
        status = OpenStatus::Adjusted;
    }
    status
}
