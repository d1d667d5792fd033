//! Turns a reference chain into a sequence of element copies.
//!
//! Resolution runs in two passes. Planning walks the chain once without
//! touching data: it validates subscripts against the descriptors it meets,
//! computes the element count and the shape of the result, and records what
//! has to be allocated before anything is copied. Walking then visits every
//! selected element in column-major order and hands contiguous runs to a
//! [`CopySink`].
//!
//! The chain side is the coarray (the source of a get, the destination of a
//! send); the other side is a flat descriptor indexed by a cursor that
//! advances with the non-single subscripts.

use tracing::trace;

use crate::descriptor::{Descriptor, MAX_DIMENSIONS};
use crate::reference::{ArrayRef, ComponentRef, RefChain, RefNode, Reference, Subscript};
use crate::runtime::error::{CafError, CafResult};
use crate::runtime::registry::{Registry, TokenId};

/// Copy of `count` consecutive elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOp {
    pub dst: *mut u8,
    pub src: *const u8,
    pub count: usize,
}

pub trait CopySink {
    fn copy(&mut self, op: CopyOp) -> CafResult<()>;
}

impl CopySink for Vec<CopyOp> {
    fn copy(&mut self, op: CopyOp) -> CafResult<()> {
        self.push(op);
        Ok(())
    }
}

/// Coalesces element copies into runs before forwarding them.
pub struct RunBuilder<'a, S: CopySink> {
    sink: &'a mut S,
    dst_size: usize,
    src_size: usize,
    pending: Option<CopyOp>,
}

impl<'a, S: CopySink> RunBuilder<'a, S> {
    pub fn new(sink: &'a mut S, dst_size: usize, src_size: usize) -> Self {
        Self {
            sink,
            dst_size,
            src_size,
            pending: None,
        }
    }

    pub fn push(&mut self, dst: *mut u8, src: *const u8) -> CafResult<()> {
        if let Some(run) = &mut self.pending {
            let next_dst = run.dst.wrapping_add(run.count * self.dst_size);
            let next_src = run.src.wrapping_add(run.count * self.src_size);
            if next_dst == dst && next_src == src {
                run.count += 1;
                return Ok(());
            }
        }
        self.flush()?;
        self.pending = Some(CopyOp { dst, src, count: 1 });
        Ok(())
    }

    pub fn finish(mut self) -> CafResult<()> {
        self.flush()
    }

    fn flush(&mut self) -> CafResult<()> {
        match self.pending.take() {
            Some(op) => self.sink.copy(op),
            None => Ok(()),
        }
    }
}

/// Storage the walk currently points at.
#[derive(Debug, Clone, Copy)]
struct Site {
    token: TokenId,
    memory: *mut u8,
    descriptor: Option<*mut Descriptor>,
    /// Reached through a registered component, so its storage may be replaced.
    registered: bool,
}

impl Site {
    fn of_token(registry: &Registry, token: TokenId) -> CafResult<Self> {
        let record = registry.record(token)?;
        Ok(Self {
            token,
            memory: record.memory_ptr(),
            descriptor: record.descriptor_ptr(),
            registered: true,
        })
    }

    fn field(&self, offset: usize) -> Self {
        let memory = self.memory.wrapping_add(offset);
        Self {
            token: self.token,
            memory,
            descriptor: Some(memory as *mut Descriptor),
            registered: false,
        }
    }

    fn elements(&self, base: *mut u8) -> Self {
        Self {
            token: self.token,
            memory: base,
            descriptor: None,
            registered: false,
        }
    }

    unsafe fn array_descriptor(&self) -> CafResult<Descriptor> {
        let ptr = self.descriptor.ok_or(CafError::MissingDescriptor)?;
        Ok(unsafe { Descriptor::load(ptr) })
    }

    fn enter(&self, registry: &Registry, component: &ComponentRef) -> CafResult<Self> {
        match *component {
            ComponentRef::Registered { index, .. } => {
                let child = registry
                    .component(self.token, index)?
                    .ok_or(CafError::UnallocatedComponent { index })?;
                Self::of_token(registry, child)
            }
            ComponentRef::Field { offset } => Ok(self.field(offset)),
        }
    }
}

fn check_rank(array: &ArrayRef, desc: &Descriptor) -> CafResult<()> {
    if array.subscripts.len() != desc.rank() {
        return Err(CafError::RankOutOfRange {
            rank: array.subscripts.len(),
            max: desc.rank(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetPlan {
    pub count: usize,
    pub item_size: usize,
    /// Extents of the result, one per non-single subscript.
    pub extents: Vec<usize>,
    /// The destination has to be (re)allocated to `extents`.
    pub reallocate: bool,
}

impl GetPlan {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Sizes a get and checks the destination against the selected shape.
///
/// # Safety
/// Descriptors reachable through the chain must be valid for reads.
pub unsafe fn plan_get(
    registry: &Registry,
    token: TokenId,
    chain: &RefChain,
    dst: &Descriptor,
    dst_reallocatable: bool,
) -> CafResult<GetPlan> {
    let mut site = Site::of_token(registry, token)?;
    let mut plan = GetPlan {
        count: 1,
        reallocate: !dst.is_allocated(),
        ..GetPlan::default()
    };
    for node in chain.nodes() {
        match &node.reference {
            Reference::Component(component) => site = site.enter(registry, component)?,
            Reference::Array(array) => {
                let desc = unsafe { site.array_descriptor()? };
                check_rank(array, &desc)?;
                for (d, subscript) in array.subscripts.iter().enumerate() {
                    subscript.check_bounds(&desc.dim[d], d)?;
                    let delta = subscript.extent(&desc.dim[d])?;
                    if delta <= 0 {
                        return Ok(GetPlan::default());
                    }
                    if !subscript.is_scalar() {
                        let dst_dim = plan.extents.len();
                        if dst_dim >= dst.rank() {
                            return Err(CafError::RankOutOfRange {
                                rank: dst_dim + 1,
                                max: dst.rank(),
                            });
                        }
                        if !plan.reallocate && dst.extent(dst_dim) != delta {
                            if !dst_reallocatable {
                                return Err(CafError::ExtentMismatch {
                                    dim: dst_dim,
                                    expected: dst.extent(dst_dim),
                                    found: delta,
                                });
                            }
                            plan.reallocate = true;
                        }
                        plan.extents.push(delta as usize);
                    }
                    plan.count *= delta as usize;
                }
                site = site.elements(desc.base_addr);
            }
        }
        plan.item_size = node.item_size;
    }
    if plan.item_size == 0 {
        return Ok(GetPlan::default());
    }
    if plan.reallocate && !dst_reallocatable {
        return Err(CafError::CannotAllocateDestination);
    }
    trace!(count = plan.count, reallocate = plan.reallocate, "planned get");
    Ok(plan)
}

/// Storage a send has to create before its copy pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provision {
    /// Register the absent allocatable component `index` of `parent`.
    /// `slot` holds its descriptor when `extents` is set, otherwise its data
    /// pointer.
    Component {
        parent: TokenId,
        index: usize,
        slot: *mut u8,
        extents: Option<Vec<usize>>,
        elem_size: usize,
    },
    /// Give the allocatable array behind `descriptor` the source's shape.
    Reshape {
        token: TokenId,
        descriptor: *mut Descriptor,
        extents: Vec<usize>,
        elem_size: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendPlan {
    pub count: usize,
    pub item_size: usize,
    pub provisions: Vec<Provision>,
}

impl SendPlan {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Extent of a subscript on a component that does not exist yet; only full
/// sections can take their shape from the source.
fn absent_extent(subscript: &Subscript, src: &Descriptor, src_dim: usize) -> CafResult<isize> {
    match subscript {
        Subscript::Full if src_dim < src.rank() => Ok(src.extent(src_dim)),
        _ => Err(CafError::CannotAllocateDestination),
    }
}

/// Sizes a send, checks the source shape against the destination and lists
/// the allocations the copy needs.
///
/// # Safety
/// Descriptors reachable through the chain must be valid for reads.
pub unsafe fn plan_send(
    registry: &Registry,
    token: TokenId,
    chain: &RefChain,
    src: &Descriptor,
    dst_reallocatable: bool,
) -> CafResult<SendPlan> {
    let nodes = chain.nodes();
    let src_rank = src.rank();
    let mut site = Some(Site::of_token(registry, token)?);
    let mut pending: Option<Provision> = None;
    let mut plan = SendPlan {
        count: 1,
        ..SendPlan::default()
    };
    let mut src_dim = 0usize;
    for (position, node) in nodes.iter().enumerate() {
        let is_last = position + 1 == nodes.len();
        match &node.reference {
            Reference::Component(component) => {
                let current = match (site, &pending) {
                    (Some(current), None) => current,
                    _ => return Err(CafError::InnerUnallocatedComponent),
                };
                site = match *component {
                    ComponentRef::Registered { index, offset } => {
                        match registry.component(current.token, index)? {
                            Some(child) => Some(Site::of_token(registry, child)?),
                            None => {
                                if !dst_reallocatable {
                                    return Err(CafError::CannotAllocateDestination);
                                }
                                pending = Some(Provision::Component {
                                    parent: current.token,
                                    index,
                                    slot: current.memory.wrapping_add(offset),
                                    extents: None,
                                    elem_size: node.item_size,
                                });
                                None
                            }
                        }
                    }
                    ComponentRef::Field { offset } => Some(current.field(offset)),
                };
            }
            Reference::Array(array) => {
                if let Some(Provision::Component {
                    extents: Some(_), ..
                }) = &pending
                {
                    return Err(CafError::InnerUnallocatedComponent);
                }
                let desc = match site {
                    Some(current) => Some(unsafe { current.array_descriptor()? }),
                    None => None,
                };
                if let Some(desc) = &desc {
                    check_rank(array, desc)?;
                }
                let reshapeable = desc.is_some()
                    && site.is_some_and(|current| current.registered)
                    && array.subscripts.iter().all(|s| matches!(s, Subscript::Full));
                let mut extents = Vec::new();
                let mut reshape = false;
                for (d, subscript) in array.subscripts.iter().enumerate() {
                    let mut delta = match &desc {
                        Some(desc) => {
                            subscript.check_bounds(&desc.dim[d], d)?;
                            subscript.extent(&desc.dim[d])?
                        }
                        None => absent_extent(subscript, src, src_dim)?,
                    };
                    if !subscript.is_scalar() && src_rank > 0 {
                        if src_dim >= src_rank {
                            return Err(CafError::RankOutOfRange {
                                rank: src_dim + 1,
                                max: src_rank,
                            });
                        }
                        let src_extent = src.extent(src_dim);
                        if src_extent != delta {
                            if !dst_reallocatable || !reshapeable {
                                return Err(CafError::ExtentMismatch {
                                    dim: d,
                                    expected: delta,
                                    found: src_extent,
                                });
                            }
                            if !is_last {
                                return Err(CafError::ReallocationOnInnerReference);
                            }
                            reshape = true;
                            delta = src_extent;
                        }
                    }
                    if delta <= 0 {
                        return Ok(SendPlan::default());
                    }
                    if !subscript.is_scalar() {
                        extents.push(delta as usize);
                        src_dim += 1;
                    }
                    plan.count *= delta as usize;
                }
                if let (true, Some(current)) = (reshape, site) {
                    let descriptor = current.descriptor.ok_or(CafError::MissingDescriptor)?;
                    plan.provisions.push(Provision::Reshape {
                        token: current.token,
                        descriptor,
                        extents: extents.clone(),
                        elem_size: node.item_size,
                    });
                }
                if let Some(Provision::Component {
                    extents: slot_extents,
                    elem_size,
                    ..
                }) = &mut pending
                {
                    *slot_extents = Some(extents);
                    *elem_size = node.item_size;
                }
                site = match (site, desc) {
                    (Some(current), Some(desc)) => Some(current.elements(desc.base_addr)),
                    _ => None,
                };
            }
        }
        plan.item_size = node.item_size;
    }
    if plan.item_size == 0 {
        return Ok(SendPlan::default());
    }
    if let Some(provision) = pending {
        plan.provisions.push(provision);
    }
    trace!(
        count = plan.count,
        provisions = plan.provisions.len(),
        "planned send"
    );
    Ok(plan)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Get,
    Send,
}

/// Position in the flat side of a transfer.
struct FlatCursor {
    base: *mut u8,
    elem_size: usize,
    rank: usize,
    strides: [isize; MAX_DIMENSIONS],
    index: [isize; MAX_DIMENSIONS],
}

impl FlatCursor {
    fn new(desc: &Descriptor) -> Self {
        let mut strides = [0; MAX_DIMENSIONS];
        for (d, dim) in desc.dims().iter().enumerate() {
            strides[d] = dim.stride;
        }
        Self {
            base: desc.base_addr,
            elem_size: desc.elem_len(),
            rank: desc.rank(),
            strides,
            index: [0; MAX_DIMENSIONS],
        }
    }

    /// A rank-0 flat side stays on its single element.
    fn set(&mut self, dim: usize, i: isize) {
        if dim < self.rank {
            self.index[dim] = i * self.strides[dim];
        }
    }

    fn address(&self) -> *mut u8 {
        let offset: isize = self.index[..self.rank].iter().sum();
        self.base.wrapping_offset(offset * self.elem_size as isize)
    }
}

struct ArrayFrame<'c> {
    array: &'c ArrayRef,
    desc: Descriptor,
    flat_dims: [Option<usize>; MAX_DIMENSIONS],
    next_flat_dim: usize,
    item_size: usize,
    site: Site,
}

struct Walker<'r, 's, S: CopySink> {
    registry: &'r Registry,
    direction: Direction,
    flat: FlatCursor,
    out: RunBuilder<'s, S>,
}

impl<S: CopySink> Walker<'_, '_, S> {
    unsafe fn nodes(&mut self, nodes: &[RefNode], site: Site, flat_dim: usize) -> CafResult<()> {
        let Some((node, rest)) = nodes.split_first() else {
            return self.emit(site.memory);
        };
        match &node.reference {
            Reference::Component(component) => {
                let next = site.enter(self.registry, component)?;
                unsafe { self.nodes(rest, next, flat_dim) }
            }
            Reference::Array(array) => {
                let desc = unsafe { site.array_descriptor()? };
                check_rank(array, &desc)?;
                let mut flat_dims = [None; MAX_DIMENSIONS];
                let mut next_flat_dim = flat_dim;
                for (d, subscript) in array.subscripts.iter().enumerate() {
                    subscript.check_bounds(&desc.dim[d], d)?;
                    if !subscript.is_scalar() {
                        flat_dims[d] = Some(next_flat_dim);
                        next_flat_dim += 1;
                    }
                }
                let frame = ArrayFrame {
                    array,
                    desc,
                    flat_dims,
                    next_flat_dim,
                    item_size: node.item_size,
                    site,
                };
                unsafe { self.dims(&frame, rest, array.subscripts.len(), desc.base_addr) }
            }
        }
    }

    /// Iterates subscript `level - 1`; the last subscript is outermost so the
    /// first one varies fastest.
    unsafe fn dims(
        &mut self,
        frame: &ArrayFrame<'_>,
        rest: &[RefNode],
        level: usize,
        elem: *mut u8,
    ) -> CafResult<()> {
        if level == 0 {
            return unsafe { self.nodes(rest, frame.site.elements(elem), frame.next_flat_dim) };
        }
        let d = level - 1;
        let subscript = &frame.array.subscripts[d];
        let dim = frame.desc.dim[d];
        let extent = subscript.extent(&dim)?;
        for i in 0..extent {
            if let Some(flat_dim) = frame.flat_dims[d] {
                self.flat.set(flat_dim, i);
            }
            let offset = subscript.position(&dim, i) * frame.item_size as isize;
            unsafe { self.dims(frame, rest, d, elem.wrapping_offset(offset))? };
        }
        Ok(())
    }

    fn emit(&mut self, chain_addr: *mut u8) -> CafResult<()> {
        let flat = self.flat.address();
        match self.direction {
            Direction::Get => self.out.push(flat, chain_addr),
            Direction::Send => self.out.push(chain_addr, flat),
        }
    }
}

unsafe fn walk<S: CopySink>(
    direction: Direction,
    registry: &Registry,
    token: TokenId,
    chain: &RefChain,
    flat: &Descriptor,
    sink: &mut S,
) -> CafResult<()> {
    let (dst_size, src_size) = match direction {
        Direction::Get => (flat.elem_len(), chain.item_size()),
        Direction::Send => (chain.item_size(), flat.elem_len()),
    };
    let mut walker = Walker {
        registry,
        direction,
        flat: FlatCursor::new(flat),
        out: RunBuilder::new(sink, dst_size, src_size),
    };
    let root = Site::of_token(registry, token)?;
    unsafe { walker.nodes(chain.nodes(), root, 0)? };
    walker.out.finish()
}

/// Emits the copies of a get: chain elements into `dst`.
///
/// # Safety
/// `dst` must describe writable storage of the planned shape, and every
/// descriptor reachable through the chain must be valid.
pub unsafe fn walk_get<S: CopySink>(
    registry: &Registry,
    token: TokenId,
    chain: &RefChain,
    dst: &Descriptor,
    sink: &mut S,
) -> CafResult<()> {
    unsafe { walk(Direction::Get, registry, token, chain, dst, sink) }
}

/// Emits the copies of a send: `src` elements into the chain. A rank-0
/// source is broadcast to every selected element.
///
/// # Safety
/// As for [`walk_get`], with `src` readable.
pub unsafe fn walk_send<S: CopySink>(
    registry: &Registry,
    token: TokenId,
    chain: &RefChain,
    src: &Descriptor,
    sink: &mut S,
) -> CafResult<()> {
    unsafe { walk(Direction::Send, registry, token, chain, src, sink) }
}
