//! Reference chains: the path from a token's storage to the elements a
//! by-reference transfer touches.

pub mod notation;
pub mod raw;

use crate::descriptor::{Dimension, MAX_DIMENSIONS};
use crate::runtime::error::{CafError, CafResult};

#[derive(Debug, Clone, PartialEq)]
pub struct RefNode {
    pub reference: Reference,
    /// Size in bytes of one item this node yields.
    pub item_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    Component(ComponentRef),
    Array(ArrayRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRef {
    /// Allocatable component registered as child `index` of the current
    /// token; `offset` locates its descriptor or data pointer in the parent.
    Registered { index: usize, offset: usize },
    /// Plain field at a byte offset inside the current storage.
    Field { offset: usize },
}

impl ComponentRef {
    pub fn offset(&self) -> usize {
        match self {
            ComponentRef::Registered { offset, .. } | ComponentRef::Field { offset } => *offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRef {
    pub subscripts: Vec<Subscript>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Subscript {
    Full,
    Single(isize),
    Range {
        start: isize,
        end: isize,
        stride: isize,
    },
    OpenEnd {
        start: isize,
        stride: isize,
    },
    OpenStart {
        end: isize,
        stride: isize,
    },
    Vector(IndexVector),
}

impl Subscript {
    /// Number of indices selected in `dim`; zero or less selects nothing.
    pub fn extent(&self, dim: &Dimension) -> CafResult<isize> {
        Ok(match self {
            Subscript::Full => dim.extent(),
            Subscript::Single(_) => 1,
            Subscript::Range { start, end, stride } => triplet_extent(*start, *end, *stride)?,
            Subscript::OpenEnd { start, stride } => {
                triplet_extent(*start, dim.upper_bound, *stride)?
            }
            Subscript::OpenStart { end, stride } => {
                triplet_extent(dim.lower_bound, *end, *stride)?
            }
            Subscript::Vector(indices) => indices.len() as isize,
        })
    }

    /// Index selected at position `i` of the section.
    pub fn index(&self, dim: &Dimension, i: isize) -> isize {
        match self {
            Subscript::Full => dim.lower_bound + i,
            Subscript::Single(index) => *index,
            Subscript::Range { start, stride, .. } | Subscript::OpenEnd { start, stride } => {
                start + i * stride
            }
            Subscript::OpenStart { stride, .. } => dim.lower_bound + i * stride,
            Subscript::Vector(indices) => indices.get(i as usize),
        }
    }

    /// Element offset of the `i`-th selected index relative to the first
    /// element of `dim`, scaled by the dimension stride.
    pub fn position(&self, dim: &Dimension, i: isize) -> isize {
        (self.index(dim, i) - dim.lower_bound) * dim.stride
    }

    /// Fails when any selected index lies outside `dim`. Triplets are
    /// monotonic, so their first and last index decide.
    pub fn check_bounds(&self, dim: &Dimension, axis: usize) -> CafResult<()> {
        let extent = self.extent(dim)?;
        if extent <= 0 {
            return Ok(());
        }
        let check = |index: isize| {
            if (dim.lower_bound..=dim.upper_bound).contains(&index) {
                Ok(())
            } else {
                Err(CafError::SubscriptOutOfBounds {
                    dim: axis,
                    index,
                    lower: dim.lower_bound,
                    upper: dim.upper_bound,
                })
            }
        };
        match self {
            Subscript::Full => Ok(()),
            Subscript::Vector(indices) => indices.iter().try_for_each(check),
            _ => {
                check(self.index(dim, 0))?;
                check(self.index(dim, extent - 1))
            }
        }
    }

    /// Single indices select one element and drop the dimension.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Subscript::Single(_))
    }
}

fn triplet_extent(start: isize, end: isize, stride: isize) -> CafResult<isize> {
    if stride == 0 {
        return Err(CafError::ZeroStride);
    }
    Ok((end - start) / stride + 1)
}

/// Vector subscript indices, kept in the integer kind they were given in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexVector {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    I128(Vec<i128>),
}

impl IndexVector {
    pub fn len(&self) -> usize {
        match self {
            IndexVector::I8(v) => v.len(),
            IndexVector::I16(v) => v.len(),
            IndexVector::I32(v) => v.len(),
            IndexVector::I64(v) => v.len(),
            IndexVector::I128(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> i32 {
        match self {
            IndexVector::I8(_) => 1,
            IndexVector::I16(_) => 2,
            IndexVector::I32(_) => 4,
            IndexVector::I64(_) => 8,
            IndexVector::I128(_) => 16,
        }
    }

    pub fn get(&self, i: usize) -> isize {
        match self {
            IndexVector::I8(v) => v[i] as isize,
            IndexVector::I16(v) => v[i] as isize,
            IndexVector::I32(v) => v[i] as isize,
            IndexVector::I64(v) => v[i] as isize,
            IndexVector::I128(v) => v[i] as isize,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = isize> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }

    /// Narrows `values` into the vector of integer kind `kind`.
    pub fn from_values(kind: i32, values: &[i128]) -> CafResult<Self> {
        fn narrow<T: TryFrom<i128>>(kind: i32, values: &[i128]) -> CafResult<Vec<T>> {
            values
                .iter()
                .map(|v| T::try_from(*v).map_err(|_| CafError::UnknownIndexKind { kind }))
                .collect()
        }
        Ok(match kind {
            1 => IndexVector::I8(narrow(kind, values)?),
            2 => IndexVector::I16(narrow(kind, values)?),
            4 => IndexVector::I32(narrow(kind, values)?),
            8 => IndexVector::I64(narrow(kind, values)?),
            16 => IndexVector::I128(values.to_vec()),
            _ => return Err(CafError::UnknownIndexKind { kind }),
        })
    }
}

/// Non-empty chain whose first node is a component reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RefChain {
    nodes: Vec<RefNode>,
}

impl RefChain {
    pub fn new(nodes: Vec<RefNode>) -> CafResult<Self> {
        let first = nodes.first().ok_or(CafError::EmptyReferenceChain)?;
        if !matches!(first.reference, Reference::Component(_)) {
            return Err(CafError::FirstReferenceNotComponent);
        }
        for node in &nodes {
            if let Reference::Array(array) = &node.reference {
                if array.subscripts.is_empty() || array.subscripts.len() > MAX_DIMENSIONS {
                    return Err(CafError::RankOutOfRange {
                        rank: array.subscripts.len(),
                        max: MAX_DIMENSIONS,
                    });
                }
            }
        }
        Ok(Self { nodes })
    }

    pub fn builder() -> RefChainBuilder {
        RefChainBuilder::default()
    }

    pub fn nodes(&self) -> &[RefNode] {
        &self.nodes
    }

    /// Item size of the last node, i.e. the element size of the transfer.
    pub fn item_size(&self) -> usize {
        self.nodes.last().map(|node| node.item_size).unwrap_or(0)
    }

    /// Rank of the result: the number of non-single subscripts.
    pub fn selected_rank(&self) -> usize {
        self.nodes
            .iter()
            .filter_map(|node| match &node.reference {
                Reference::Array(array) => {
                    Some(array.subscripts.iter().filter(|s| !s.is_scalar()).count())
                }
                Reference::Component(_) => None,
            })
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct RefChainBuilder {
    nodes: Vec<RefNode>,
}

impl RefChainBuilder {
    pub fn component(mut self, index: usize, offset: usize, item_size: usize) -> Self {
        self.nodes.push(RefNode {
            reference: Reference::Component(ComponentRef::Registered { index, offset }),
            item_size,
        });
        self
    }

    pub fn field(mut self, offset: usize, item_size: usize) -> Self {
        self.nodes.push(RefNode {
            reference: Reference::Component(ComponentRef::Field { offset }),
            item_size,
        });
        self
    }

    pub fn array(mut self, subscripts: Vec<Subscript>, item_size: usize) -> Self {
        self.nodes.push(RefNode {
            reference: Reference::Array(ArrayRef { subscripts }),
            item_size,
        });
        self
    }

    pub fn build(self) -> CafResult<RefChain> {
        RefChain::new(self.nodes)
    }
}
