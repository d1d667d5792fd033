//! Array descriptors exchanged with compiled code.
//!
//! The layout is `#[repr(C)]` and versioned through [`DType::version`]. A
//! descriptor may live inside coarray memory (components of derived types),
//! so every access to one that the runtime does not own goes through
//! [`Descriptor::load`] / [`Descriptor::store`], which tolerate unaligned
//! storage.

use std::fmt;
use std::ptr;

use crate::runtime::error::{CafError, CafResult};

pub const MAX_DIMENSIONS: usize = 15;
pub const DESCRIPTOR_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Integer,
    Logical,
    Real,
    Complex,
    Derived,
    Character,
}

impl TypeTag {
    pub const fn code(self) -> i8 {
        match self {
            TypeTag::Integer => 1,
            TypeTag::Logical => 2,
            TypeTag::Real => 3,
            TypeTag::Complex => 4,
            TypeTag::Derived => 5,
            TypeTag::Character => 6,
        }
    }

    pub fn from_code(code: i8) -> Option<Self> {
        Some(match code {
            1 => TypeTag::Integer,
            2 => TypeTag::Logical,
            3 => TypeTag::Real,
            4 => TypeTag::Complex,
            5 => TypeTag::Derived,
            6 => TypeTag::Character,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            TypeTag::Integer => "integer",
            TypeTag::Logical => "logical",
            TypeTag::Real => "real",
            TypeTag::Complex => "complex",
            TypeTag::Derived => "derived",
            TypeTag::Character => "character",
        }
    }
}

/// Element type of an array: base type plus kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementType {
    pub tag: TypeTag,
    pub kind: i32,
}

impl ElementType {
    pub const fn new(tag: TypeTag, kind: i32) -> Self {
        Self { tag, kind }
    }

    pub const fn integer(kind: i32) -> Self {
        Self::new(TypeTag::Integer, kind)
    }

    pub const fn logical(kind: i32) -> Self {
        Self::new(TypeTag::Logical, kind)
    }

    pub const fn real(kind: i32) -> Self {
        Self::new(TypeTag::Real, kind)
    }

    pub const fn complex(kind: i32) -> Self {
        Self::new(TypeTag::Complex, kind)
    }

    pub const fn character(kind: i32) -> Self {
        Self::new(TypeTag::Character, kind)
    }

    pub const fn derived() -> Self {
        Self::new(TypeTag::Derived, 0)
    }

    /// Builds an element type from the raw codes carried over the ABI.
    pub fn from_raw(type_code: i32, kind: i32) -> CafResult<Self> {
        i8::try_from(type_code)
            .ok()
            .and_then(TypeTag::from_code)
            .map(|tag| Self::new(tag, kind))
            .ok_or(CafError::UnknownType { code: type_code })
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(kind={})", self.tag.name(), self.kind)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DType {
    pub elem_len: usize,
    pub version: i32,
    pub rank: i8,
    pub type_code: i8,
    pub kind: i8,
    pub attribute: i8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dimension {
    /// Distance between consecutive elements, in elements.
    pub stride: isize,
    pub lower_bound: isize,
    pub upper_bound: isize,
}

impl Dimension {
    pub const fn new(lower_bound: isize, upper_bound: isize, stride: isize) -> Self {
        Self {
            stride,
            lower_bound,
            upper_bound,
        }
    }

    /// Number of indices in the dimension; zero or negative means empty.
    pub const fn extent(&self) -> isize {
        self.upper_bound - self.lower_bound + 1
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub base_addr: *mut u8,
    pub offset: isize,
    pub dtype: DType,
    pub span: isize,
    pub dim: [Dimension; MAX_DIMENSIONS],
}

impl Descriptor {
    /// Descriptor of a single element at `base_addr`.
    pub fn scalar(ty: ElementType, elem_len: usize, base_addr: *mut u8) -> Self {
        Self::with_rank(ty, elem_len, base_addr, 0)
    }

    /// Contiguous column-major array over `bounds` (lower, upper) pairs.
    pub fn array(
        ty: ElementType,
        elem_len: usize,
        base_addr: *mut u8,
        bounds: &[(isize, isize)],
    ) -> CafResult<Self> {
        if bounds.len() > MAX_DIMENSIONS {
            return Err(CafError::RankOutOfRange {
                rank: bounds.len(),
                max: MAX_DIMENSIONS,
            });
        }
        let mut desc = Self::with_rank(ty, elem_len, base_addr, bounds.len());
        let mut stride = 1isize;
        for (d, &(lower, upper)) in bounds.iter().enumerate() {
            desc.dim[d] = Dimension::new(lower, upper, stride);
            stride *= (upper - lower + 1).max(0);
        }
        Ok(desc)
    }

    /// Descriptor with no storage yet; extents are filled in on allocation.
    pub fn unallocated(ty: ElementType, elem_len: usize, rank: usize) -> Self {
        Self::with_rank(ty, elem_len, ptr::null_mut(), rank.min(MAX_DIMENSIONS))
    }

    fn with_rank(ty: ElementType, elem_len: usize, base_addr: *mut u8, rank: usize) -> Self {
        Self {
            base_addr,
            offset: 0,
            dtype: DType {
                elem_len,
                version: DESCRIPTOR_VERSION,
                rank: rank as i8,
                type_code: ty.tag.code(),
                kind: ty.kind as i8,
                attribute: 0,
            },
            span: elem_len as isize,
            dim: [Dimension::default(); MAX_DIMENSIONS],
        }
    }

    pub fn rank(&self) -> usize {
        (self.dtype.rank.max(0) as usize).min(MAX_DIMENSIONS)
    }

    pub fn elem_len(&self) -> usize {
        self.dtype.elem_len
    }

    pub fn is_allocated(&self) -> bool {
        !self.base_addr.is_null()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dim[..self.rank()]
    }

    pub fn extent(&self, dim: usize) -> isize {
        self.dim[dim].extent()
    }

    pub fn element_type(&self) -> CafResult<ElementType> {
        TypeTag::from_code(self.dtype.type_code)
            .map(|tag| ElementType::new(tag, i32::from(self.dtype.kind)))
            .ok_or(CafError::UnknownType {
                code: i32::from(self.dtype.type_code),
            })
    }

    pub fn set_element_type(&mut self, ty: ElementType) {
        self.dtype.type_code = ty.tag.code();
        self.dtype.kind = ty.kind as i8;
    }

    pub fn set_dimension(&mut self, dim: usize, lower_bound: isize, upper_bound: isize, stride: isize) {
        self.dim[dim] = Dimension::new(lower_bound, upper_bound, stride);
    }

    /// Total elements; a rank-0 descriptor holds one, any empty dimension
    /// makes the whole array empty.
    pub fn element_count(&self) -> usize {
        self.dims().iter().fold(1usize, |count, dim| {
            let extent = dim.extent();
            if extent <= 0 {
                0
            } else {
                count.saturating_mul(extent as usize)
            }
        })
    }

    /// Offset in elements of the `linear`-th element in column-major order.
    pub fn element_offset(&self, linear: usize) -> isize {
        let mut remainder = linear as isize;
        let mut offset = 0;
        for dim in self.dims() {
            let extent = dim.extent().max(1);
            offset += (remainder % extent) * dim.stride;
            remainder /= extent;
        }
        offset
    }

    /// Reads a descriptor stored at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to `size_of::<Descriptor>()` readable bytes.
    pub unsafe fn load(ptr: *const Descriptor) -> Descriptor {
        unsafe { ptr::read_unaligned(ptr) }
    }

    /// Writes this descriptor to `ptr`.
    ///
    /// # Safety
    /// `ptr` must point to `size_of::<Descriptor>()` writable bytes.
    pub unsafe fn store(&self, ptr: *mut Descriptor) {
        unsafe { ptr::write_unaligned(ptr, *self) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_strides_are_column_major() {
        let desc =
            Descriptor::array(ElementType::integer(4), 4, ptr::null_mut(), &[(1, 3), (0, 3)])
                .unwrap();
        assert_eq!(desc.rank(), 2);
        assert_eq!(desc.dim[0].stride, 1);
        assert_eq!(desc.dim[1].stride, 3);
        assert_eq!(desc.element_count(), 12);
        assert_eq!(desc.element_offset(4), 1 + 3);
        assert_eq!(desc.element_offset(11), 2 + 9);
    }

    #[test]
    fn empty_dimension_means_no_elements() {
        let desc =
            Descriptor::array(ElementType::real(8), 8, ptr::null_mut(), &[(1, 4), (3, 2)]).unwrap();
        assert_eq!(desc.element_count(), 0);
        let scalar = Descriptor::scalar(ElementType::real(8), 8, ptr::null_mut());
        assert_eq!(scalar.element_count(), 1);
    }

    #[test]
    fn unknown_type_code_is_reported() {
        let mut desc = Descriptor::scalar(ElementType::integer(4), 4, ptr::null_mut());
        desc.dtype.type_code = 42;
        assert!(matches!(
            desc.element_type(),
            Err(CafError::UnknownType { code: 42 })
        ));
    }

    #[test]
    fn descriptors_survive_unaligned_storage() {
        let desc =
            Descriptor::array(ElementType::character(4), 12, ptr::null_mut(), &[(2, 9)]).unwrap();
        let mut buffer = vec![0u8; std::mem::size_of::<Descriptor>() + 1];
        unsafe {
            let slot = buffer.as_mut_ptr().add(1) as *mut Descriptor;
            desc.store(slot);
            let back = Descriptor::load(slot);
            assert_eq!(back.dtype, desc.dtype);
            assert_eq!(back.dims(), desc.dims());
        }
    }
}
