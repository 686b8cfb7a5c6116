//! 80-bit IEEE 754 extended precision, as stored in the AIFF COMM chunk.
//!
//! Layout: 1 sign bit, 15-bit exponent biased by 16383, 64-bit mantissa with
//! an explicit integer bit, big-endian.

const EXT_BIAS: i32 = 16383;
const F64_BIAS: i32 = 1023;
const EXP_MAX: u16 = 0x7FFF;

pub fn to_ieee_extended(value: f64) -> [u8; 10] {
    let bits = value.to_bits();
    let sign: u16 = if bits >> 63 != 0 { 0x8000 } else { 0 };
    let exp = ((bits >> 52) & 0x7FF) as i32;
    let frac = bits & ((1_u64 << 52) - 1);

    let (exponent, mantissa) = if exp == 0 && frac == 0 {
        (0_u16, 0_u64)
    } else if exp == 0x7FF {
        // Infinity keeps a zero mantissa; NaN gets the quiet bit.
        let mantissa = if frac == 0 { 0 } else { 0xC000_0000_0000_0000 };
        (EXP_MAX, mantissa)
    } else if exp == 0 {
        // Denormal input: normalise so the integer bit is set.
        let shift = frac.leading_zeros();
        let e = EXT_BIAS + 63 - 1074 - shift as i32;
        (e as u16, frac << shift)
    } else {
        let e = exp - F64_BIAS + EXT_BIAS;
        if e >= i32::from(EXP_MAX) {
            (EXP_MAX, 0)
        } else {
            (e as u16, (1_u64 << 63) | (frac << 11))
        }
    };

    let mut out = [0_u8; 10];
    out[..2].copy_from_slice(&(sign | exponent).to_be_bytes());
    out[2..].copy_from_slice(&mantissa.to_be_bytes());
    out
}

#[cfg(test)]
pub(crate) fn from_ieee_extended(bytes: [u8; 10]) -> f64 {
    let head = u16::from_be_bytes([bytes[0], bytes[1]]);
    let sign = u64::from(head >> 15) << 63;
    let exp = i32::from(head & EXP_MAX);
    let mut m = [0_u8; 8];
    m.copy_from_slice(&bytes[2..]);
    let mantissa = u64::from_be_bytes(m);

    if mantissa == 0 {
        if exp == i32::from(EXP_MAX) {
            return f64::from_bits(sign | (0x7FF_u64 << 52));
        }
        return f64::from_bits(sign);
    }
    if exp == i32::from(EXP_MAX) {
        return f64::NAN;
    }
    let f64_exp = exp - EXT_BIAS + F64_BIAS;
    if f64_exp >= 0x7FF {
        return f64::from_bits(sign | (0x7FF_u64 << 52));
    }
    if f64_exp >= 1 {
        let frac = (mantissa << 1) >> 12;
        return f64::from_bits(sign | ((f64_exp as u64) << 52) | frac);
    }
    let shift = 15372 - exp;
    if !(0..64).contains(&shift) {
        return f64::from_bits(sign);
    }
    f64::from_bits(sign | (mantissa >> shift))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_rates() {
        assert_eq!(
            to_ieee_extended(44_100.0),
            [0x40, 0x0E, 0xAC, 0x44, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            to_ieee_extended(48_000.0),
            [0x40, 0x0E, 0xBB, 0x80, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            to_ieee_extended(8_000.0),
            [0x40, 0x0B, 0xFA, 0x00, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn zero_and_sign() {
        assert_eq!(to_ieee_extended(0.0), [0; 10]);
        let neg = to_ieee_extended(-0.0);
        assert_eq!(neg[0], 0x80);
        assert!(neg[1..].iter().all(|b| *b == 0));
        assert_eq!(to_ieee_extended(-1.0)[..4], [0xBF, 0xFF, 0x80, 0x00]);
    }

    #[test]
    fn infinity_and_nan() {
        let inf = to_ieee_extended(f64::INFINITY);
        assert_eq!(inf[..2], [0x7F, 0xFF]);
        assert!(inf[2..].iter().all(|b| *b == 0));
        let nan = to_ieee_extended(f64::NAN);
        assert_eq!(nan[..3], [0x7F, 0xFF, 0xC0]);
        assert!(from_ieee_extended(inf).is_infinite());
        assert!(from_ieee_extended(nan).is_nan());
    }

    #[test]
    fn denormals_round_trip() {
        for value in [f64::MIN_POSITIVE / 4.0, 5e-324, f64::MIN_POSITIVE * 0.75] {
            let enc = to_ieee_extended(value);
            assert_eq!(enc[2] & 0x80, 0x80, "integer bit must be set for {value:e}");
            assert_eq!(from_ieee_extended(enc), value);
        }
    }

    #[test]
    fn rates_round_trip() {
        for rate in [8_000.0, 11_025.0, 22_050.0, 32_000.0, 44_100.0, 96_000.0, 192_000.0, 0.5] {
            assert_eq!(from_ieee_extended(to_ieee_extended(rate)), rate);
        }
        assert_eq!(from_ieee_extended(to_ieee_extended(f64::MAX)), f64::MAX);
    }
}
