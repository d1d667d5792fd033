//! Data movement: direct get/send at byte offsets and the by-reference
//! variants driven by reference chains.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::convert::{ElementLayout, copy_elements};
use crate::descriptor::{Descriptor, ElementType};
use crate::reference::RefChain;
use crate::resolve::{self, CopyOp, CopySink, Provision, RunBuilder};
use crate::runtime::Runtime;
use crate::runtime::alloc::{Allocation, Allocator};
use crate::runtime::error::{CafError, CafResult};
use crate::runtime::registry::{DescriptorSlot, RegistrationKind, TokenId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    /// Source and destination may overlap; stage through a temporary.
    pub may_require_tmp: bool,
    /// The destination may be allocated or reshaped to fit.
    pub dst_reallocatable: bool,
}

/// Array section of a coarray addressed by byte offset into its storage.
#[derive(Debug, Clone, Copy)]
pub struct RemoteSection<'a> {
    pub token: TokenId,
    pub offset: usize,
    pub image: i32,
    /// Layout of the section; its base address is ignored.
    pub desc: &'a Descriptor,
}

/// Coarray data addressed by a reference chain.
#[derive(Debug, Clone, Copy)]
pub struct RemoteRef<'a> {
    pub token: TokenId,
    pub image: i32,
    pub chain: &'a RefChain,
    pub ty: ElementType,
}

struct ConvertingSink {
    dst: ElementLayout,
    src: ElementLayout,
}

impl CopySink for ConvertingSink {
    fn copy(&mut self, op: CopyOp) -> CafResult<()> {
        // Ops only come from bounds-checked sections or resolved chains.
        unsafe { copy_elements(op.dst, self.dst, op.src, self.src, op.count)? };
        Ok(())
    }
}

fn stage_through_temporary<S: CopySink>(
    ops: &[CopyOp],
    src_size: usize,
    sink: &mut S,
) -> CafResult<()> {
    let total: usize = ops.iter().map(|op| op.count * src_size).sum();
    let mut temp = vec![0u8; total];
    let mut cursor = 0;
    for op in ops {
        let bytes = op.count * src_size;
        unsafe { ptr::copy_nonoverlapping(op.src, temp.as_mut_ptr().add(cursor), bytes) };
        cursor += bytes;
    }
    cursor = 0;
    for op in ops {
        let src = unsafe { temp.as_ptr().add(cursor) };
        sink.copy(CopyOp {
            dst: op.dst,
            src,
            count: op.count,
        })?;
        cursor += op.count * src_size;
    }
    Ok(())
}

fn execute(
    ops: &[CopyOp],
    dst: ElementLayout,
    src: ElementLayout,
    may_require_tmp: bool,
) -> CafResult<()> {
    let mut sink = ConvertingSink { dst, src };
    if may_require_tmp {
        return stage_through_temporary(ops, src.size, &mut sink);
    }
    for op in ops {
        sink.copy(*op)?;
    }
    trace!(runs = ops.len(), "executed copies");
    Ok(())
}

fn check_range(offset: isize, len: usize, size: usize) -> CafResult<()> {
    let in_bounds = usize::try_from(offset)
        .ok()
        .and_then(|start| start.checked_add(len))
        .is_some_and(|end| end <= size);
    if in_bounds {
        Ok(())
    } else {
        Err(CafError::OutOfBounds { offset, len, size })
    }
}

fn layout_of(desc: &Descriptor) -> CafResult<ElementLayout> {
    Ok(ElementLayout::new(desc.element_type()?, desc.elem_len()))
}

/// Element count shared by both sides; a rank-0 `other` broadcasts.
fn conforming_count(shaped: &Descriptor, other: &Descriptor) -> CafResult<usize> {
    let count = shaped.element_count();
    if other.rank() > 0 && other.element_count() != count {
        return Err(CafError::ShapeMismatch {
            expected: count,
            found: other.element_count(),
        });
    }
    Ok(count)
}

fn element_address(desc: &Descriptor, i: usize) -> *mut u8 {
    if desc.rank() == 0 {
        return desc.base_addr;
    }
    desc.base_addr
        .wrapping_offset(desc.element_offset(i) * desc.elem_len() as isize)
}

fn remote_offset(offset: usize, desc: &Descriptor, i: usize) -> isize {
    let within = if desc.rank() == 0 {
        0
    } else {
        desc.element_offset(i) * desc.elem_len() as isize
    };
    offset as isize + within
}

/// Gives `dst` a fresh contiguous block shaped by `extents`, keeping the
/// rest of its metadata.
fn reallocate_destination(
    allocator: &Arc<dyn Allocator>,
    dst: &mut Descriptor,
    extents: &[usize],
    count: usize,
) -> CafResult<Allocation> {
    let bytes = count
        .checked_mul(dst.elem_len())
        .ok_or(CafError::allocation(usize::MAX))?;
    let storage = Allocation::new(allocator, bytes)?;
    reshape(dst, extents);
    dst.base_addr = storage.as_ptr();
    debug!(bytes, rank = extents.len(), "allocated transfer destination");
    Ok(storage)
}

fn reshape(desc: &mut Descriptor, extents: &[usize]) {
    let mut stride = 1isize;
    for (d, &extent) in extents.iter().enumerate() {
        desc.set_dimension(d, 1, extent as isize, stride);
        stride *= extent as isize;
    }
}

impl Runtime {
    /// Copies the section `src` of the coarray at `offset` into `dst`.
    ///
    /// # Safety
    /// `dst` must describe writable local storage.
    pub unsafe fn get(
        &self,
        token: TokenId,
        offset: usize,
        image: i32,
        dst: &Descriptor,
        src: &Descriptor,
        may_require_tmp: bool,
    ) -> CafResult<()> {
        self.check_image(image)?;
        let record = self.registry.record(token)?;
        let (base, size) = (record.memory_ptr(), record.len());
        let (dst_layout, src_layout) = (layout_of(dst)?, layout_of(src)?);
        let count = conforming_count(dst, src)?;
        let mut ops = Vec::new();
        let mut runs = RunBuilder::new(&mut ops, dst_layout.size, src_layout.size);
        for i in 0..count {
            let remote = remote_offset(offset, src, i);
            check_range(remote, src_layout.size, size)?;
            runs.push(element_address(dst, i), base.wrapping_offset(remote))?;
        }
        runs.finish()?;
        trace!(%token, count, "get");
        execute(&ops, dst_layout, src_layout, may_require_tmp)
    }

    /// Copies local `src` into the section `dst` of the coarray at `offset`.
    /// A rank-0 source is broadcast.
    ///
    /// # Safety
    /// `src` must describe readable local storage.
    pub unsafe fn send(
        &self,
        token: TokenId,
        offset: usize,
        image: i32,
        dst: &Descriptor,
        src: &Descriptor,
        may_require_tmp: bool,
    ) -> CafResult<()> {
        self.check_image(image)?;
        let record = self.registry.record(token)?;
        let (base, size) = (record.memory_ptr(), record.len());
        let (dst_layout, src_layout) = (layout_of(dst)?, layout_of(src)?);
        let count = conforming_count(dst, src)?;
        let mut ops = Vec::new();
        let mut runs = RunBuilder::new(&mut ops, dst_layout.size, src_layout.size);
        for i in 0..count {
            let remote = remote_offset(offset, dst, i);
            check_range(remote, dst_layout.size, size)?;
            runs.push(base.wrapping_offset(remote), element_address(src, i))?;
        }
        runs.finish()?;
        trace!(%token, count, "send");
        execute(&ops, dst_layout, src_layout, may_require_tmp)
    }

    /// Coarray-to-coarray copy; on a single image both sides are local.
    ///
    /// # Safety
    /// Both sections must lie in their coarrays' storage.
    pub unsafe fn send_get(
        &self,
        dst: RemoteSection<'_>,
        src: RemoteSection<'_>,
        may_require_tmp: bool,
    ) -> CafResult<()> {
        self.check_image(src.image)?;
        let record = self.registry.record(src.token)?;
        let size = record.len();
        let elem_len = src.desc.elem_len();
        let count = src.desc.element_count();
        for i in 0..count {
            check_range(remote_offset(src.offset, src.desc, i), elem_len, size)?;
        }
        let mut local = *src.desc;
        local.base_addr = record.memory_ptr().wrapping_add(src.offset);
        unsafe { self.send(dst.token, dst.offset, dst.image, dst.desc, &local, may_require_tmp) }
    }

    /// Reads the data selected by `chain` into `dst`. When `dst` has to be
    /// (re)allocated the new block is returned and `dst` points into it.
    ///
    /// # Safety
    /// `dst` must describe writable storage unless it is about to be
    /// reallocated; descriptors reachable through the chain must be valid.
    pub unsafe fn get_by_ref(
        &self,
        token: TokenId,
        image: i32,
        dst: &mut Descriptor,
        chain: &RefChain,
        src_type: ElementType,
        options: TransferOptions,
    ) -> CafResult<Option<Allocation>> {
        self.check_image(image)?;
        let plan = unsafe {
            resolve::plan_get(&self.registry, token, chain, dst, options.dst_reallocatable)?
        };
        if plan.is_empty() {
            trace!(%token, chain = %chain, "empty get_by_ref");
            return Ok(None);
        }
        let original = *dst;
        let storage = if plan.reallocate {
            Some(reallocate_destination(
                self.registry.allocator(),
                dst,
                &plan.extents,
                plan.count,
            )?)
        } else {
            None
        };
        let src_layout = ElementLayout::new(src_type, plan.item_size);
        let copied = layout_of(dst).and_then(|dst_layout| {
            let mut ops = Vec::new();
            unsafe { resolve::walk_get(&self.registry, token, chain, dst, &mut ops)? };
            execute(&ops, dst_layout, src_layout, options.may_require_tmp)
        });
        match copied {
            Ok(()) => {
                trace!(%token, chain = %chain, count = plan.count, "get_by_ref");
                Ok(storage)
            }
            Err(error) => {
                *dst = original;
                Err(error)
            }
        }
    }

    /// Writes `src` into the data selected by `chain`, registering absent
    /// components and reshaping allocatable arrays first when allowed.
    ///
    /// # Safety
    /// `src` must describe readable storage; descriptors reachable through
    /// the chain must be valid.
    pub unsafe fn send_by_ref(
        &mut self,
        token: TokenId,
        image: i32,
        src: &Descriptor,
        chain: &RefChain,
        dst_type: ElementType,
        options: TransferOptions,
    ) -> CafResult<()> {
        self.check_image(image)?;
        let plan = unsafe {
            resolve::plan_send(&self.registry, token, chain, src, options.dst_reallocatable)?
        };
        if plan.is_empty() {
            trace!(%token, chain = %chain, "empty send_by_ref");
            return Ok(());
        }
        for provision in &plan.provisions {
            unsafe { self.provide(provision, dst_type)? };
        }
        let dst_layout = ElementLayout::new(dst_type, plan.item_size);
        let src_layout = layout_of(src)?;
        let mut ops = Vec::new();
        unsafe { resolve::walk_send(&self.registry, token, chain, src, &mut ops)? };
        trace!(%token, chain = %chain, count = plan.count, "send_by_ref");
        execute(&ops, dst_layout, src_layout, options.may_require_tmp)
    }

    /// Chained coarray-to-coarray copy through a temporary typed like the
    /// source; the temporary is released on every path.
    ///
    /// # Safety
    /// As for [`Runtime::get_by_ref`] and [`Runtime::send_by_ref`].
    pub unsafe fn send_get_by_ref(
        &mut self,
        dst: RemoteRef<'_>,
        src: RemoteRef<'_>,
        may_require_tmp: bool,
    ) -> CafResult<()> {
        let mut temp =
            Descriptor::unallocated(src.ty, src.chain.item_size(), src.chain.selected_rank());
        let options = TransferOptions {
            may_require_tmp,
            dst_reallocatable: true,
        };
        let fetched =
            unsafe { self.get_by_ref(src.token, src.image, &mut temp, src.chain, src.ty, options)? };
        let Some(_storage) = fetched else {
            return Ok(());
        };
        unsafe { self.send_by_ref(dst.token, dst.image, &temp, dst.chain, dst.ty, options) }
    }

    unsafe fn provide(&mut self, provision: &Provision, dst_type: ElementType) -> CafResult<()> {
        match provision {
            Provision::Component {
                parent,
                index,
                slot,
                extents: Some(extents),
                elem_size,
            } => {
                let bounds: Vec<(isize, isize)> =
                    extents.iter().map(|&extent| (1, extent as isize)).collect();
                let desc = Descriptor::array(dst_type, *elem_size, ptr::null_mut(), &bounds)?;
                let desc_ptr =
                    NonNull::new(*slot as *mut Descriptor).ok_or(CafError::MissingDescriptor)?;
                unsafe { desc.store(desc_ptr.as_ptr()) };
                let bytes = extents.iter().product::<usize>() * elem_size;
                self.registry.register_component(
                    *parent,
                    RegistrationKind::CoarrayAlloc,
                    bytes,
                    *index,
                    DescriptorSlot::borrowed(desc_ptr),
                    0,
                )?;
            }
            Provision::Component {
                parent,
                index,
                slot,
                extents: None,
                elem_size,
            } => {
                let desc = Descriptor::scalar(dst_type, *elem_size, ptr::null_mut());
                let child = self.registry.register_component(
                    *parent,
                    RegistrationKind::CoarrayAlloc,
                    *elem_size,
                    *index,
                    DescriptorSlot::owned(desc),
                    0,
                )?;
                let slot = NonNull::new(*slot).ok_or(CafError::MissingDescriptor)?;
                unsafe { self.registry.publish(child, slot)? };
            }
            Provision::Reshape {
                token,
                descriptor,
                extents,
                elem_size,
            } => {
                let bytes = extents.iter().product::<usize>() * elem_size;
                let memory = self.registry.reallocate(*token, bytes)?;
                let mut desc = unsafe { Descriptor::load(*descriptor) };
                reshape(&mut desc, extents);
                desc.base_addr = memory;
                unsafe { desc.store(*descriptor) };
            }
        }
        Ok(())
    }
}
