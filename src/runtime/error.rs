use miette::Diagnostic;
use thiserror::Error;

use crate::convert::ConversionError;
use crate::runtime::registry::TokenId;

pub type CafResult<T> = Result<T, CafError>;

/// Failures reported through `stat`/`errmsg`, or fatally when the caller
/// supplied no status slot.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq)]
pub enum CafError {
    #[error("Failed to allocate coarray")]
    #[diagnostic(code(caf::allocation_failed))]
    AllocationFailed { bytes: usize },
    #[error("Component index {index} out of range (token has {count} components)")]
    #[diagnostic(code(caf::component_index))]
    ComponentIndexOutOfRange { index: usize, count: usize },
    #[error("Component {index} is already registered")]
    #[diagnostic(code(caf::component_registered))]
    ComponentAlreadyRegistered { index: usize },
    #[error("Allocatable component {index} is not allocated")]
    #[diagnostic(code(caf::unallocated_component))]
    UnallocatedComponent { index: usize },
    #[error("Invalid or stale coarray token {token}")]
    #[diagnostic(code(caf::invalid_token))]
    InvalidToken { token: TokenId },
    #[error("Null coarray token")]
    #[diagnostic(code(caf::null_token))]
    NullToken,
    #[error("Token {token} is a component; deregister it through its parent")]
    #[diagnostic(code(caf::component_token))]
    ComponentToken { token: TokenId },
    #[error("Unknown reference type {code}")]
    #[diagnostic(code(caf::reference_type))]
    UnknownReferenceType { code: i32 },
    #[error("Unsupported reference chain version {version}")]
    #[diagnostic(code(caf::reference_version))]
    UnsupportedReferenceVersion { version: i32 },
    #[error("Unknown array reference type {code}")]
    #[diagnostic(code(caf::array_reference_type))]
    UnknownArraySubscript { code: i32 },
    #[error("Unsupported vector subscript kind {kind}")]
    #[diagnostic(code(caf::vector_kind))]
    UnknownIndexKind { kind: i32 },
    #[error("Unknown type code {code}")]
    #[diagnostic(code(caf::type_code))]
    UnknownType { code: i32 },
    #[error("Unknown atomic operation {code}")]
    #[diagnostic(code(caf::atomic_op))]
    UnknownAtomicOperation { code: i32 },
    #[error("Unknown registration kind {code}")]
    #[diagnostic(code(caf::registration_kind))]
    UnknownRegistrationKind { code: i32 },
    #[error("First ref needs to be a component ref")]
    #[diagnostic(code(caf::first_reference))]
    FirstReferenceNotComponent,
    #[error("Reference chain is empty")]
    #[diagnostic(code(caf::empty_reference))]
    EmptyReferenceChain,
    #[error("Array reference on storage without a descriptor")]
    #[diagnostic(code(caf::missing_descriptor))]
    MissingDescriptor,
    #[error("Rank out of range ({rank} > {max})")]
    #[diagnostic(code(caf::rank))]
    RankOutOfRange { rank: usize, max: usize },
    #[error("Subscript stride must not be zero")]
    #[diagnostic(code(caf::zero_stride))]
    ZeroStride,
    #[error("Index {index} out of bounds {lower}:{upper} in dimension {dim}")]
    #[diagnostic(code(caf::subscript_bounds))]
    SubscriptOutOfBounds {
        dim: usize,
        index: isize,
        lower: isize,
        upper: isize,
    },
    #[error(
        "Extent of non-allocatable array mismatch in dimension {dim} ({expected} != {found})"
    )]
    #[diagnostic(code(caf::extent_mismatch))]
    ExtentMismatch {
        dim: usize,
        expected: isize,
        found: isize,
    },
    #[error("Array shapes do not conform ({expected} != {found} elements)")]
    #[diagnostic(code(caf::shape_mismatch))]
    ShapeMismatch { expected: usize, found: usize },
    #[error("Reallocation of array followed by component ref not allowed")]
    #[diagnostic(code(caf::inner_reallocation))]
    ReallocationOnInnerReference,
    #[error("Inner unallocated component detected")]
    #[diagnostic(code(caf::inner_unallocated))]
    InnerUnallocatedComponent,
    #[error("Can not allocate memory for a non-allocatable destination")]
    #[diagnostic(code(caf::destination_allocation))]
    CannotAllocateDestination,
    #[error(transparent)]
    #[diagnostic(transparent)]
    Conversion(#[from] ConversionError),
    #[error("Access of {len} bytes at offset {offset} outside {size}-byte coarray")]
    #[diagnostic(code(caf::out_of_bounds))]
    OutOfBounds { offset: isize, len: usize, size: usize },
    #[error("Synchronization cell at offset {offset} is not {align}-byte aligned")]
    #[diagnostic(code(caf::misaligned))]
    MisalignedAtomic { offset: usize, align: usize },
    #[error("Already locked")]
    #[diagnostic(code(caf::already_locked))]
    AlreadyLocked,
    #[error("Variable is not locked")]
    #[diagnostic(code(caf::not_locked))]
    NotLocked,
    #[error("Image {image} does not exist; only image 1 is available")]
    #[diagnostic(code(caf::invalid_image))]
    InvalidImage { image: i32 },
    #[error("Atomic variables must be of kind 4, got kind {kind}")]
    #[diagnostic(code(caf::atomic_kind))]
    UnsupportedAtomicKind { kind: i32 },
    #[error("Required argument `{name}` is null")]
    #[diagnostic(code(caf::null_argument))]
    NullArgument { name: &'static str },
    #[error("Coarray runtime is not initialized")]
    #[diagnostic(code(caf::not_initialized), help("call caf_init before any other entry point"))]
    NotInitialized,
}

impl CafError {
    pub fn allocation(bytes: usize) -> Self {
        CafError::AllocationFailed { bytes }
    }
}
