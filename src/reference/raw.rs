//! C layout of reference chains as emitted by the compiler.

use std::ffi::c_void;

use crate::descriptor::MAX_DIMENSIONS;
use crate::runtime::error::{CafError, CafResult};

use super::{ArrayRef, ComponentRef, IndexVector, RefChain, RefNode, Reference, Subscript};

pub const RAW_REFERENCE_VERSION: i32 = 1;

pub const REF_COMPONENT: i32 = 0;
pub const REF_ARRAY: i32 = 1;

pub const ARR_REF_NONE: i32 = 0;
pub const ARR_REF_VECTOR: i32 = 1;
pub const ARR_REF_FULL: i32 = 2;
pub const ARR_REF_RANGE: i32 = 3;
pub const ARR_REF_SINGLE: i32 = 4;
pub const ARR_REF_OPEN_END: i32 = 5;
pub const ARR_REF_OPEN_START: i32 = 6;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawReference {
    pub next: *const RawReference,
    pub version: i32,
    pub ref_type: i32,
    pub item_size: usize,
    pub u: RawReferenceData,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union RawReferenceData {
    pub c: RawComponent,
    pub a: RawArray,
}

/// `index < 0` marks a plain field.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawComponent {
    pub offset: isize,
    pub index: isize,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawArray {
    pub mode: [i32; MAX_DIMENSIONS],
    pub dim: [RawDimension; MAX_DIMENSIONS],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union RawDimension {
    pub s: RawTriplet,
    pub v: RawVector,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawTriplet {
    pub start: isize,
    pub end: isize,
    pub stride: isize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawVector {
    pub vector: *const c_void,
    pub nvec: usize,
    pub kind: i32,
}

unsafe fn read_vector(raw: &RawVector) -> CafResult<IndexVector> {
    unsafe fn collect<T: Copy>(raw: &RawVector) -> Vec<T> {
        if raw.nvec == 0 || raw.vector.is_null() {
            return Vec::new();
        }
        unsafe { std::slice::from_raw_parts(raw.vector as *const T, raw.nvec).to_vec() }
    }
    unsafe {
        Ok(match raw.kind {
            1 => IndexVector::I8(collect(raw)),
            2 => IndexVector::I16(collect(raw)),
            4 => IndexVector::I32(collect(raw)),
            8 => IndexVector::I64(collect(raw)),
            16 => IndexVector::I128(collect(raw)),
            kind => return Err(CafError::UnknownIndexKind { kind }),
        })
    }
}

unsafe fn decode_array(raw: &RawArray) -> CafResult<ArrayRef> {
    let mut subscripts = Vec::new();
    for d in 0..MAX_DIMENSIONS {
        let mode = raw.mode[d];
        if mode == ARR_REF_NONE {
            break;
        }
        let dim = raw.dim[d];
        let subscript = unsafe {
            match mode {
                ARR_REF_VECTOR => Subscript::Vector(read_vector(&dim.v)?),
                ARR_REF_FULL => Subscript::Full,
                ARR_REF_RANGE => Subscript::Range {
                    start: dim.s.start,
                    end: dim.s.end,
                    stride: dim.s.stride,
                },
                ARR_REF_SINGLE => Subscript::Single(dim.s.start),
                ARR_REF_OPEN_END => Subscript::OpenEnd {
                    start: dim.s.start,
                    stride: dim.s.stride,
                },
                ARR_REF_OPEN_START => Subscript::OpenStart {
                    end: dim.s.end,
                    stride: dim.s.stride,
                },
                code => return Err(CafError::UnknownArraySubscript { code }),
            }
        };
        subscripts.push(subscript);
    }
    Ok(ArrayRef { subscripts })
}

/// Decodes the linked list starting at `head` into an owned chain.
///
/// # Safety
/// Every node reachable from `head` and every vector it names must be valid
/// for reads.
pub unsafe fn decode_chain(head: *const RawReference) -> CafResult<RefChain> {
    let mut nodes = Vec::new();
    let mut cursor = head;
    while let Some(raw) = unsafe { cursor.as_ref() } {
        if raw.version != RAW_REFERENCE_VERSION {
            return Err(CafError::UnsupportedReferenceVersion {
                version: raw.version,
            });
        }
        let reference = unsafe {
            match raw.ref_type {
                REF_COMPONENT => {
                    let c = raw.u.c;
                    let offset = usize::try_from(c.offset)
                        .map_err(|_| CafError::UnknownReferenceType { code: raw.ref_type })?;
                    Reference::Component(match usize::try_from(c.index) {
                        Ok(index) => ComponentRef::Registered { index, offset },
                        Err(_) => ComponentRef::Field { offset },
                    })
                }
                REF_ARRAY => Reference::Array(decode_array(&raw.u.a)?),
                code => return Err(CafError::UnknownReferenceType { code }),
            }
        };
        nodes.push(RefNode {
            reference,
            item_size: raw.item_size,
        });
        cursor = raw.next;
    }
    RefChain::new(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    fn component(next: *const RawReference, index: isize, offset: isize, item_size: usize) -> RawReference {
        RawReference {
            next,
            version: RAW_REFERENCE_VERSION,
            ref_type: REF_COMPONENT,
            item_size,
            u: RawReferenceData {
                c: RawComponent { offset, index },
            },
        }
    }

    fn empty_array() -> RawArray {
        RawArray {
            mode: [ARR_REF_NONE; MAX_DIMENSIONS],
            dim: [RawDimension {
                s: RawTriplet {
                    start: 0,
                    end: 0,
                    stride: 0,
                },
            }; MAX_DIMENSIONS],
        }
    }

    #[test]
    fn decodes_component_and_array_nodes() {
        let indices = [3i16, 1];
        let mut array = empty_array();
        array.mode[0] = ARR_REF_RANGE;
        array.dim[0].s = RawTriplet {
            start: 1,
            end: 7,
            stride: 3,
        };
        array.mode[1] = ARR_REF_VECTOR;
        array.dim[1].v = RawVector {
            vector: indices.as_ptr() as *const c_void,
            nvec: indices.len(),
            kind: 2,
        };
        let tail = RawReference {
            next: ptr::null(),
            version: RAW_REFERENCE_VERSION,
            ref_type: REF_ARRAY,
            item_size: 8,
            u: RawReferenceData { a: array },
        };
        let head = component(&tail, 1, 32, 8);
        let chain = unsafe { decode_chain(&head) }.unwrap();
        assert_eq!(chain.to_string(), "%1@32<8> (1:7:3,[3,1]_2)<8>");
    }

    #[test]
    fn negative_index_is_a_plain_field() {
        let head = component(ptr::null(), -1, 16, 4);
        let chain = unsafe { decode_chain(&head) }.unwrap();
        assert_eq!(chain.to_string(), "+16<4>");
    }

    #[test]
    fn rejects_unknown_codes() {
        let mut head = component(ptr::null(), 0, 0, 4);
        head.ref_type = 7;
        assert_eq!(
            unsafe { decode_chain(&head) },
            Err(CafError::UnknownReferenceType { code: 7 })
        );

        let mut array = empty_array();
        array.mode[0] = 9;
        let tail = RawReference {
            next: ptr::null(),
            version: RAW_REFERENCE_VERSION,
            ref_type: REF_ARRAY,
            item_size: 4,
            u: RawReferenceData { a: array },
        };
        let head = component(&tail, 0, 0, 4);
        assert_eq!(
            unsafe { decode_chain(&head) },
            Err(CafError::UnknownArraySubscript { code: 9 })
        );
        assert_eq!(
            unsafe { decode_chain(ptr::null()) },
            Err(CafError::EmptyReferenceChain)
        );
    }
}
