//! Element conversion between numeric kinds and character widths.
//!
//! Numeric values are read exactly into `i128` or a [`Wide`] real (a pair of
//! them for complex) and rounded once into the destination: integer
//! narrowing wraps, real to integer truncates and saturates, complex to real
//! or integer keeps the real part.

pub mod wide;

use std::ptr;

use miette::Diagnostic;
use thiserror::Error;

use crate::convert::wide::{RealFormat, Wide};
use crate::descriptor::{ElementType, TypeTag};

#[derive(Debug, Error, Diagnostic, Clone, Copy, PartialEq, Eq)]
#[error("Can't convert type {from} to type {to}")]
#[diagnostic(code(caf::conversion))]
pub struct ConversionError {
    pub from: ElementType,
    pub to: ElementType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scalar {
    Int(i128),
    Real(Wide),
    Complex(Wide, Wide),
}

/// Bytes one real part occupies for a given kind.
fn real_slot(kind: i32) -> Option<usize> {
    match kind {
        4 => Some(4),
        8 => Some(8),
        10 | 16 => Some(16),
        _ => None,
    }
}

unsafe fn read_real(src: *const u8, kind: i32) -> Option<Wide> {
    let format = RealFormat::for_kind(kind)?;
    let bits = unsafe {
        match kind {
            4 => u128::from(ptr::read_unaligned(src as *const u32)),
            8 => u128::from(ptr::read_unaligned(src as *const u64)),
            10 => u128::from_le_bytes(ptr::read_unaligned(src as *const [u8; 16])),
            _ => ptr::read_unaligned(src as *const u128),
        }
    };
    Some(format.decode(bits))
}

unsafe fn write_real(dst: *mut u8, kind: i32, value: Wide) -> bool {
    let Some(format) = RealFormat::for_kind(kind) else {
        return false;
    };
    let bits = format.encode(value);
    unsafe {
        match kind {
            4 => ptr::write_unaligned(dst as *mut u32, bits as u32),
            8 => ptr::write_unaligned(dst as *mut u64, bits as u64),
            10 => ptr::write_unaligned(dst as *mut [u8; 16], bits.to_le_bytes()),
            _ => ptr::write_unaligned(dst as *mut u128, bits),
        }
    }
    true
}

unsafe fn read_scalar(src: *const u8, ty: ElementType) -> Option<Scalar> {
    unsafe {
        match ty.tag {
            TypeTag::Integer => Some(Scalar::Int(match ty.kind {
                1 => i128::from(ptr::read_unaligned(src as *const i8)),
                2 => i128::from(ptr::read_unaligned(src as *const i16)),
                4 => i128::from(ptr::read_unaligned(src as *const i32)),
                8 => i128::from(ptr::read_unaligned(src as *const i64)),
                16 => ptr::read_unaligned(src as *const i128),
                _ => return None,
            })),
            TypeTag::Real => read_real(src, ty.kind).map(Scalar::Real),
            TypeTag::Complex => {
                let slot = real_slot(ty.kind)?;
                let re = read_real(src, ty.kind)?;
                let im = read_real(src.add(slot), ty.kind)?;
                Some(Scalar::Complex(re, im))
            }
            _ => None,
        }
    }
}

unsafe fn write_integer(dst: *mut u8, kind: i32, value: Scalar) -> bool {
    macro_rules! store {
        ($ty:ty) => {{
            let narrowed = match value {
                Scalar::Int(v) => v as $ty,
                Scalar::Real(v) | Scalar::Complex(v, _) => v.to_integer(<$ty>::BITS) as $ty,
            };
            unsafe { ptr::write_unaligned(dst as *mut $ty, narrowed) }
        }};
    }
    match kind {
        1 => store!(i8),
        2 => store!(i16),
        4 => store!(i32),
        8 => store!(i64),
        16 => store!(i128),
        _ => return false,
    }
    true
}

unsafe fn write_scalar(dst: *mut u8, ty: ElementType, value: Scalar) -> bool {
    let zero = Wide::from_i128(0);
    let (re, im) = match value {
        Scalar::Int(v) => (Wide::from_i128(v), zero),
        Scalar::Real(v) => (v, zero),
        Scalar::Complex(re, im) => (re, im),
    };
    unsafe {
        match ty.tag {
            TypeTag::Integer => write_integer(dst, ty.kind, value),
            TypeTag::Real => write_real(dst, ty.kind, re),
            TypeTag::Complex => match real_slot(ty.kind) {
                Some(slot) => write_real(dst, ty.kind, re) && write_real(dst.add(slot), ty.kind, im),
                None => false,
            },
            _ => false,
        }
    }
}

/// Converts one numeric element from `src_ty` to `dst_ty`.
///
/// # Safety
/// `src` and `dst` must be valid for an element of their respective types.
pub unsafe fn convert_element(
    dst: *mut u8,
    dst_ty: ElementType,
    src: *const u8,
    src_ty: ElementType,
) -> Result<(), ConversionError> {
    let error = ConversionError {
        from: src_ty,
        to: dst_ty,
    };
    if !matches!(dst_ty.tag, TypeTag::Integer | TypeTag::Real | TypeTag::Complex) {
        return Err(error);
    }
    let value = unsafe { read_scalar(src, src_ty) }.ok_or(error)?;
    if unsafe { write_scalar(dst, dst_ty, value) } {
        Ok(())
    } else {
        Err(error)
    }
}

/// Assigns a character element of `src_len` bytes to one of `dst_len` bytes,
/// narrowing or widening between kinds 1 and 4 and padding with blanks.
/// Code points above 255 become `?` when narrowing.
///
/// # Safety
/// `src` must be readable for `src_len` bytes and `dst` writable for
/// `dst_len` bytes.
pub unsafe fn assign_character(
    dst: *mut u8,
    dst_len: usize,
    dst_kind: i32,
    src: *const u8,
    src_len: usize,
    src_kind: i32,
) -> Result<(), ConversionError> {
    let dst_units = dst_len / char_width(dst_kind);
    let src_units = src_len / char_width(src_kind);
    let copied = dst_units.min(src_units);
    unsafe {
        match (dst_kind, src_kind) {
            (1, 1) | (4, 4) => ptr::copy(src, dst, copied * char_width(dst_kind)),
            (1, 4) => {
                for i in 0..copied {
                    let unit = ptr::read_unaligned((src as *const u32).add(i));
                    *dst.add(i) = u8::try_from(unit).unwrap_or(b'?');
                }
            }
            (4, 1) => {
                for i in 0..copied {
                    let unit = u32::from(*src.add(i));
                    ptr::write_unaligned((dst as *mut u32).add(i), unit);
                }
            }
            _ => {
                return Err(ConversionError {
                    from: ElementType::character(src_kind),
                    to: ElementType::character(dst_kind),
                });
            }
        }
        pad_blanks(dst, dst_kind, copied, dst_units);
    }
    Ok(())
}

fn char_width(kind: i32) -> usize {
    if kind == 4 { 4 } else { 1 }
}

unsafe fn pad_blanks(dst: *mut u8, kind: i32, from: usize, to: usize) {
    unsafe {
        if kind == 4 {
            for i in from..to {
                ptr::write_unaligned((dst as *mut u32).add(i), u32::from(b' '));
            }
        } else if to > from {
            ptr::write_bytes(dst.add(from), b' ', to - from);
        }
    }
}

/// Layout of one side of an element copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementLayout {
    pub ty: ElementType,
    pub size: usize,
}

impl ElementLayout {
    pub const fn new(ty: ElementType, size: usize) -> Self {
        Self { ty, size }
    }
}

/// Copies `count` consecutive elements, converting when the types differ.
/// Identical types move `min(dst.size, src.size)` bytes and blank-pad
/// longer character destinations.
///
/// # Safety
/// Both runs must be valid for `count` elements of their layouts.
pub unsafe fn copy_elements(
    dst: *mut u8,
    dst_layout: ElementLayout,
    src: *const u8,
    src_layout: ElementLayout,
    count: usize,
) -> Result<(), ConversionError> {
    let ElementLayout { ty: dst_ty, size: dst_size } = dst_layout;
    let ElementLayout { ty: src_ty, size: src_size } = src_layout;
    unsafe {
        if dst_ty == src_ty && dst_size == src_size {
            ptr::copy(src, dst, dst_size * count);
            return Ok(());
        }
        for i in 0..count {
            let d = dst.add(i * dst_size);
            let s = src.add(i * src_size);
            if dst_ty.tag == TypeTag::Character && src_ty.tag == TypeTag::Character {
                assign_character(d, dst_size, dst_ty.kind, s, src_size, src_ty.kind)?;
            } else if dst_ty == src_ty {
                ptr::copy(s, d, dst_size.min(src_size));
            } else {
                convert_element(d, dst_ty, s, src_ty)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convert<const N: usize, const M: usize>(
        src: [u8; M],
        src_ty: ElementType,
        dst_ty: ElementType,
    ) -> Result<[u8; N], ConversionError> {
        let mut out = [0u8; N];
        unsafe { convert_element(out.as_mut_ptr(), dst_ty, src.as_ptr(), src_ty)? };
        Ok(out)
    }

    #[test]
    fn integer_widening_and_narrowing() {
        let wide: [u8; 8] =
            convert((-7i32).to_ne_bytes(), ElementType::integer(4), ElementType::integer(8))
                .unwrap();
        assert_eq!(i64::from_ne_bytes(wide), -7);
        let narrow: [u8; 1] =
            convert(300i32.to_ne_bytes(), ElementType::integer(4), ElementType::integer(1))
                .unwrap();
        assert_eq!(narrow[0] as i8, 300i32 as i8);
        let big: [u8; 16] =
            convert(i64::MIN.to_ne_bytes(), ElementType::integer(8), ElementType::integer(16))
                .unwrap();
        assert_eq!(i128::from_ne_bytes(big), i128::from(i64::MIN));
    }

    #[test]
    fn real_to_integer_truncates_and_saturates() {
        let truncated: [u8; 4] =
            convert((-2.75f64).to_ne_bytes(), ElementType::real(8), ElementType::integer(4))
                .unwrap();
        assert_eq!(i32::from_ne_bytes(truncated), -2);
        let saturated: [u8; 2] =
            convert(1.0e10f32.to_ne_bytes(), ElementType::real(4), ElementType::integer(2))
                .unwrap();
        assert_eq!(i16::from_ne_bytes(saturated), i16::MAX);
    }

    #[test]
    fn complex_round_trips_through_wider_kinds() {
        let mut src = [0u8; 8];
        src[..4].copy_from_slice(&1.5f32.to_ne_bytes());
        src[4..].copy_from_slice(&(-0.25f32).to_ne_bytes());
        let wide: [u8; 32] = convert(src, ElementType::complex(4), ElementType::complex(16)).unwrap();
        let back: [u8; 8] = convert(wide, ElementType::complex(16), ElementType::complex(4)).unwrap();
        assert_eq!(back, src);
        let real: [u8; 8] = convert(src, ElementType::complex(4), ElementType::real(8)).unwrap();
        assert_eq!(f64::from_ne_bytes(real), 1.5);
    }

    #[test]
    fn integer_to_complex_has_zero_imaginary_part() {
        let out: [u8; 16] =
            convert(3i16.to_ne_bytes(), ElementType::integer(2), ElementType::complex(8)).unwrap();
        assert_eq!(f64::from_ne_bytes(out[..8].try_into().unwrap()), 3.0);
        assert_eq!(f64::from_ne_bytes(out[8..].try_into().unwrap()), 0.0);
    }

    #[test]
    fn extended_reals_round_trip() {
        for kind in [10, 16] {
            let wide: [u8; 16] =
                convert(0.1f64.to_ne_bytes(), ElementType::real(8), ElementType::real(kind))
                    .unwrap();
            let back: [u8; 8] =
                convert(wide, ElementType::real(kind), ElementType::real(8)).unwrap();
            assert_eq!(f64::from_ne_bytes(back), 0.1);
        }
    }

    fn element_size(ty: ElementType) -> usize {
        match ty.tag {
            TypeTag::Complex => 2 * real_slot(ty.kind).unwrap(),
            TypeTag::Real => real_slot(ty.kind).unwrap(),
            _ => ty.kind as usize,
        }
    }

    fn convert_bytes(src: &[u8], src_ty: ElementType, dst_ty: ElementType) -> Vec<u8> {
        let mut out = vec![0u8; element_size(dst_ty)];
        unsafe { convert_element(out.as_mut_ptr(), dst_ty, src.as_ptr(), src_ty) }
            .unwrap_or_else(|err| panic!("{err}"));
        out
    }

    fn integer_bytes(kind: i32, value: i128) -> Vec<u8> {
        match kind {
            1 => (value as i8).to_ne_bytes().to_vec(),
            2 => (value as i16).to_ne_bytes().to_vec(),
            4 => (value as i32).to_ne_bytes().to_vec(),
            8 => (value as i64).to_ne_bytes().to_vec(),
            _ => value.to_ne_bytes().to_vec(),
        }
    }

    fn real_bytes(kind: i32, value: Wide) -> Vec<u8> {
        let bits = RealFormat::for_kind(kind).unwrap().encode(value);
        match kind {
            4 => (bits as u32).to_ne_bytes().to_vec(),
            8 => (bits as u64).to_ne_bytes().to_vec(),
            10 => bits.to_le_bytes().to_vec(),
            _ => bits.to_ne_bytes().to_vec(),
        }
    }

    fn supported_types() -> Vec<ElementType> {
        let mut types: Vec<ElementType> = [1, 2, 4, 8, 16].map(ElementType::integer).to_vec();
        for kind in [4, 8, 10, 16] {
            types.push(ElementType::real(kind));
            types.push(ElementType::complex(kind));
        }
        types
    }

    /// Extremes and a full-precision value of each type.
    fn samples(ty: ElementType) -> Vec<Vec<u8>> {
        if ty.tag == TypeTag::Integer {
            let bits = ty.kind as u32 * 8;
            let max = if bits == 128 { i128::MAX } else { (1i128 << (bits - 1)) - 1 };
            return [0, -1, 42, max, -max - 1]
                .iter()
                .map(|&v| integer_bytes(ty.kind, v))
                .collect();
        }
        let format = RealFormat::for_kind(ty.kind).unwrap();
        let scale = format.precision as i32 - 1;
        let bias = (1 << (format.exponent_bits - 1)) - 1;
        let reals = [
            Wide::from_i128(0),
            Wide::from_i128(-3),
            Wide::Finite {
                negative: false,
                significand: (1u128 << scale) | 1,
                exponent: -scale,
            },
            Wide::Finite {
                negative: true,
                significand: (1u128 << format.precision) - 1,
                exponent: bias - scale,
            },
            Wide::Finite {
                negative: false,
                significand: 1,
                exponent: 1 - bias - scale,
            },
        ];
        let parts: Vec<Vec<u8>> = reals.iter().map(|&v| real_bytes(ty.kind, v)).collect();
        if ty.tag == TypeTag::Real {
            return parts;
        }
        (0..parts.len())
            .map(|i| [parts[i].clone(), parts[(i + 1) % parts.len()].clone()].concat())
            .collect()
    }

    fn lossless(from: ElementType, to: ElementType) -> bool {
        let format = |ty: ElementType| RealFormat::for_kind(ty.kind).unwrap();
        match (from.tag, to.tag) {
            (TypeTag::Integer, TypeTag::Integer) => from.kind <= to.kind,
            (TypeTag::Integer, TypeTag::Real | TypeTag::Complex) => {
                from.kind as u32 * 8 - 1 <= format(to).precision
            }
            (TypeTag::Real, TypeTag::Real | TypeTag::Complex)
            | (TypeTag::Complex, TypeTag::Complex) => {
                let (a, b) = (format(from), format(to));
                a.precision <= b.precision && a.exponent_bits <= b.exponent_bits
            }
            _ => false,
        }
    }

    #[test]
    fn lossless_conversions_round_trip_across_the_matrix() {
        let types = supported_types();
        let mut checked = 0;
        for &from in &types {
            for &to in &types {
                for sample in samples(from) {
                    let there = convert_bytes(&sample, from, to);
                    if lossless(from, to) {
                        let back = convert_bytes(&there, to, from);
                        assert_eq!(back, sample, "{from} -> {to}");
                        checked += 1;
                    }
                }
            }
        }
        assert!(checked > 300);
    }

    #[test]
    fn extended_kinds_keep_full_precision() {
        let odd = (1i64 << 60) + 1;
        let real10 = convert_bytes(&odd.to_ne_bytes(), ElementType::integer(8), ElementType::real(10));
        let back = convert_bytes(&real10, ElementType::real(10), ElementType::integer(8));
        assert_eq!(back, odd.to_ne_bytes());

        let big = (1i128 << 100) + 1;
        let real16 = convert_bytes(&big.to_ne_bytes(), ElementType::integer(16), ElementType::real(16));
        let back = convert_bytes(&real16, ElementType::real(16), ElementType::integer(16));
        assert_eq!(back, big.to_ne_bytes());

        let fine = ((0x3fff_u128 << 112) | 1).to_ne_bytes();
        let complex = convert_bytes(&fine, ElementType::real(16), ElementType::complex(16));
        assert_eq!(&complex[..16], &fine);
        assert_eq!(&complex[16..], &[0; 16]);
        let back = convert_bytes(&complex, ElementType::complex(16), ElementType::real(16));
        assert_eq!(back, fine);
    }

    #[test]
    fn integer_to_real_rounds_once() {
        // Half an f32 ulp plus one: rounding through f64 first would tie to even.
        let value = (1i64 << 60) + (1 << 36) + 1;
        assert_ne!(value as f64 as f32, value as f32);
        let out = convert_bytes(&value.to_ne_bytes(), ElementType::integer(8), ElementType::real(4));
        assert_eq!(f32::from_ne_bytes(out.try_into().unwrap()), value as f32);
    }

    #[test]
    fn unsupported_pairs_name_both_types() {
        let err = convert::<4, 4>([1, 0, 0, 0], ElementType::logical(4), ElementType::integer(4))
            .unwrap_err();
        assert_eq!(err.from, ElementType::logical(4));
        assert_eq!(err.to, ElementType::integer(4));
        assert_eq!(err.to_string(), "Can't convert type logical(kind=4) to type integer(kind=4)");
        assert!(
            convert::<4, 4>([0; 4], ElementType::integer(3), ElementType::integer(4)).is_err()
        );
    }

    #[test]
    fn narrowing_characters_replaces_wide_code_points() {
        let src: Vec<u8> = [0x41u32, 0x1ff, 0x42]
            .iter()
            .flat_map(|unit| unit.to_ne_bytes())
            .collect();
        let mut dst = [0u8; 5];
        unsafe {
            assign_character(dst.as_mut_ptr(), dst.len(), 1, src.as_ptr(), src.len(), 4).unwrap()
        };
        assert_eq!(&dst, b"A?B  ");
    }

    #[test]
    fn widening_characters_pads_with_blank_units() {
        let src = *b"abcdefgh";
        let mut dst = [0u8; 48];
        unsafe {
            assign_character(dst.as_mut_ptr(), dst.len(), 4, src.as_ptr(), src.len(), 1).unwrap()
        };
        let units: Vec<u32> = dst
            .chunks(4)
            .map(|chunk| u32::from_ne_bytes(chunk.try_into().unwrap()))
            .collect();
        assert_eq!(&units[..8], &"abcdefgh".chars().map(|c| c as u32).collect::<Vec<_>>()[..]);
        assert_eq!(&units[8..], &[0x20; 4]);
    }

    #[test]
    fn same_type_copies_pad_longer_characters() {
        let src = *b"ab";
        let mut dst = [0u8; 8];
        unsafe {
            copy_elements(
                dst.as_mut_ptr(),
                ElementLayout::new(ElementType::character(1), 4),
                src.as_ptr(),
                ElementLayout::new(ElementType::character(1), 1),
                2,
            )
            .unwrap()
        };
        assert_eq!(&dst, b"a   b   ");
    }
}
