//! Exact intermediate for numeric conversion.
//!
//! Every supported integer and real value is representable as a [`Wide`]
//! without loss: a sign, a 128-bit significand and a binary exponent. Values
//! are rounded once, when encoded into the destination format, to nearest
//! with ties to even, overflowing to infinity and underflowing through
//! subnormals to signed zero.

/// `(-1)^negative * significand * 2^exponent`, or a non-finite value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wide {
    Finite {
        negative: bool,
        significand: u128,
        exponent: i32,
    },
    Infinite {
        negative: bool,
    },
    Nan {
        negative: bool,
    },
}

/// Bit layout of one real kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealFormat {
    /// Significand precision, leading bit included.
    pub precision: u32,
    pub exponent_bits: u32,
    /// The x87 format stores the leading significand bit.
    pub explicit_lead: bool,
}

pub const BINARY32: RealFormat = RealFormat {
    precision: 24,
    exponent_bits: 8,
    explicit_lead: false,
};

pub const BINARY64: RealFormat = RealFormat {
    precision: 53,
    exponent_bits: 11,
    explicit_lead: false,
};

/// x87 extended precision: 64-bit significand and 15-bit exponent in the
/// low 80 bits of a 16-byte slot.
pub const X87: RealFormat = RealFormat {
    precision: 64,
    exponent_bits: 15,
    explicit_lead: true,
};

pub const BINARY128: RealFormat = RealFormat {
    precision: 113,
    exponent_bits: 15,
    explicit_lead: false,
};

fn mask(bits: u32) -> u128 {
    if bits >= 128 { u128::MAX } else { (1u128 << bits) - 1 }
}

fn round_shift(value: u128, shift: u32) -> u128 {
    match shift {
        0 => value,
        1..=127 => {
            let quotient = value >> shift;
            let remainder = value & mask(shift);
            let half = 1u128 << (shift - 1);
            if remainder > half || (remainder == half && quotient & 1 == 1) {
                quotient + 1
            } else {
                quotient
            }
        }
        128 => u128::from(value > 1u128 << 127),
        _ => 0,
    }
}

impl RealFormat {
    pub fn for_kind(kind: i32) -> Option<Self> {
        match kind {
            4 => Some(BINARY32),
            8 => Some(BINARY64),
            10 => Some(X87),
            16 => Some(BINARY128),
            _ => None,
        }
    }

    fn stored_bits(self) -> u32 {
        if self.explicit_lead {
            self.precision
        } else {
            self.precision - 1
        }
    }

    fn bias(self) -> i32 {
        (1 << (self.exponent_bits - 1)) - 1
    }

    fn max_biased(self) -> u128 {
        mask(self.exponent_bits)
    }

    fn sign_bit(self, negative: bool) -> u128 {
        u128::from(negative) << (self.stored_bits() + self.exponent_bits)
    }

    /// Reads the value held in the low bits of `bits`.
    pub fn decode(self, bits: u128) -> Wide {
        let stored = self.stored_bits();
        let fraction = bits & mask(stored);
        let biased = (bits >> stored) & self.max_biased();
        let negative = (bits >> (stored + self.exponent_bits)) & 1 == 1;
        let scale = self.precision as i32 - 1;
        if biased == self.max_biased() {
            let payload = if self.explicit_lead {
                fraction & mask(stored - 1)
            } else {
                fraction
            };
            return if payload == 0 {
                Wide::Infinite { negative }
            } else {
                Wide::Nan { negative }
            };
        }
        let (significand, exponent) = if biased == 0 {
            (fraction, 1 - self.bias() - scale)
        } else {
            let lead = if self.explicit_lead {
                0
            } else {
                1u128 << scale
            };
            (fraction | lead, biased as i32 - self.bias() - scale)
        };
        Wide::Finite {
            negative,
            significand,
            exponent,
        }
    }

    /// Rounds `value` into this format.
    pub fn encode(self, value: Wide) -> u128 {
        let stored = self.stored_bits();
        let lead = if self.explicit_lead {
            1u128 << (self.precision - 1)
        } else {
            0
        };
        let infinity = |negative| self.sign_bit(negative) | (self.max_biased() << stored) | lead;
        let (negative, significand, exponent) = match value {
            Wide::Infinite { negative } => return infinity(negative),
            Wide::Nan { negative } => {
                let quiet = 1u128 << (self.precision - 2);
                return infinity(negative) | quiet;
            }
            Wide::Finite {
                negative,
                significand,
                exponent,
            } => (negative, significand, exponent),
        };
        let sign = self.sign_bit(negative);
        if significand == 0 {
            return sign;
        }
        let scale = self.precision as i32 - 1;
        let msb = 127 - significand.leading_zeros() as i32;
        let emin = 1 - self.bias();
        let mut quantum = i64::from((exponent + msb).max(emin) - scale);
        let shift = quantum - i64::from(exponent);
        let mut mantissa = if shift > 0 {
            round_shift(significand, u32::try_from(shift).unwrap_or(u32::MAX))
        } else {
            significand << (-shift) as u32
        };
        if mantissa >> self.precision != 0 {
            mantissa >>= 1;
            quantum += 1;
        }
        if mantissa == 0 {
            return sign;
        }
        let biased = if mantissa >> scale != 0 {
            quantum + i64::from(scale) + i64::from(self.bias())
        } else {
            0
        };
        if biased >= self.max_biased() as i64 {
            return infinity(negative);
        }
        let fraction = if self.explicit_lead {
            mantissa
        } else {
            mantissa & mask(stored)
        };
        sign | ((biased as u128) << stored) | fraction
    }
}

impl Wide {
    pub fn from_i128(value: i128) -> Self {
        Wide::Finite {
            negative: value < 0,
            significand: value.unsigned_abs(),
            exponent: 0,
        }
    }

    /// Truncates toward zero and saturates into a signed integer of `bits`
    /// bits. NaN becomes zero.
    pub fn to_integer(self, bits: u32) -> i128 {
        let max = mask(bits - 1);
        let (negative, magnitude) = match self {
            Wide::Nan { .. } => return 0,
            Wide::Infinite { negative } => (negative, None),
            Wide::Finite {
                negative,
                significand,
                exponent,
            } => {
                let magnitude = if significand == 0 {
                    Some(0)
                } else if exponent >= 0 {
                    u32::try_from(exponent)
                        .ok()
                        .filter(|&shift| shift < 128 && significand.leading_zeros() >= shift)
                        .map(|shift| significand << shift)
                } else {
                    let shift = exponent.unsigned_abs();
                    Some(if shift >= 128 { 0 } else { significand >> shift })
                };
                (negative, magnitude)
            }
        };
        match (negative, magnitude) {
            (false, Some(m)) if m <= max => m as i128,
            (false, _) => max as i128,
            (true, Some(m)) if m <= max + 1 => (m as i128).wrapping_neg(),
            (true, _) => (max as i128).wrapping_neg().wrapping_sub(1),
        }
    }
}
