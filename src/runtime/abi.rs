// C entry points called by compiled coarray programs.
// One process-wide runtime lives behind a mutex between caf_init and
// caf_finalize; tokens cross the boundary as opaque pointer-sized handles.
// Storage comes from the C heap so that arrays handed back to the caller
// can be released with `free`.

#![allow(clippy::too_many_arguments)]

use std::ffi::{c_char, c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::descriptor::{Descriptor, ElementType};
use crate::reference::raw::{RawReference, decode_chain};
use crate::runtime::Runtime;
use crate::runtime::alloc::MallocAllocator;
use crate::runtime::error::{CafError, CafResult};
use crate::runtime::registry::{RegistrationKind, TokenId};
use crate::runtime::status::{Status, settle};
use crate::runtime::sync::{ATOMIC_CELL, AtomicOp};
use crate::runtime::transfer::{RemoteRef, RemoteSection, TransferOptions};

/// Opaque token handle; null is never a live token.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CafToken(pub *mut c_void);

impl CafToken {
    pub const fn null() -> Self {
        Self(ptr::null_mut())
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    fn from_id(id: TokenId) -> Self {
        Self(id.to_bits() as usize as *mut c_void)
    }

    fn id(self) -> CafResult<TokenId> {
        TokenId::from_bits(self.0 as usize as u64).ok_or(CafError::NullToken)
    }
}

unsafe impl Send for CafToken {}
unsafe impl Sync for CafToken {}

static STATE: Mutex<Option<Runtime>> = Mutex::new(None);

unsafe fn status_from<'a>(stat: *mut c_int, errmsg: *mut c_char, errmsg_len: c_int) -> Option<Status<'a>> {
    let stat = unsafe { stat.as_mut() }?;
    let status = Status::new(stat);
    match usize::try_from(errmsg_len) {
        Ok(len) if len > 0 && !errmsg.is_null() => {
            let buffer = unsafe { slice::from_raw_parts_mut(errmsg as *mut u8, len) };
            Some(status.with_errmsg(buffer))
        }
        _ => Some(status),
    }
}

fn with_state<T>(
    mut status: Option<Status<'_>>,
    op: impl FnOnce(&mut Runtime) -> CafResult<T>,
) -> Option<T> {
    let mut guard = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    let (result, config) = match guard.as_mut() {
        Some(runtime) => {
            let result = op(runtime);
            (result, runtime.config().clone())
        }
        None => (Err(CafError::NotInitialized), RuntimeConfig::from_env()),
    };
    settle(result, status.as_mut(), &config)
}

fn component_index(index: c_int) -> usize {
    // Negative indices fail the registry's range check.
    usize::try_from(index).unwrap_or(usize::MAX)
}

unsafe fn retyped(desc: *const Descriptor, kind: c_int) -> CafResult<Descriptor> {
    let mut desc = unsafe { desc.as_ref() }
        .copied()
        .ok_or(CafError::MissingDescriptor)?;
    let ty = desc.element_type()?;
    desc.set_element_type(ElementType::new(ty.tag, kind));
    Ok(desc)
}

fn atomic_kind(kind: c_int) -> CafResult<()> {
    if kind as usize != ATOMIC_CELL {
        return Err(CafError::UnsupportedAtomicKind { kind });
    }
    Ok(())
}

unsafe fn read_word(value: *const c_void, name: &'static str) -> CafResult<u32> {
    if value.is_null() {
        return Err(CafError::NullArgument { name });
    }
    Ok(unsafe { (value as *const u32).read_unaligned() })
}

unsafe fn write_word(slot: *mut c_void, value: u32) {
    if !slot.is_null() {
        unsafe { (slot as *mut u32).write_unaligned(value) };
    }
}

#[unsafe(export_name = "caf_init")]
pub unsafe extern "C" fn caf_init(_argc: *mut c_int, _argv: *mut *mut *mut c_char) {
    let mut guard = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if guard.is_none() {
        let allocator = Arc::new(MallocAllocator);
        *guard = Some(Runtime::with_allocator(RuntimeConfig::from_env(), allocator));
    }
}

#[unsafe(export_name = "caf_finalize")]
pub unsafe extern "C" fn caf_finalize() {
    let mut guard = STATE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(mut runtime) = guard.take() {
        runtime.finalize();
        debug!(live = runtime.registry().live_tokens(), "releasing coarray storage");
    }
}

#[unsafe(export_name = "caf_this_image")]
pub extern "C" fn caf_this_image(_distance: c_int) -> c_int {
    1
}

#[unsafe(export_name = "caf_num_images")]
pub extern "C" fn caf_num_images(_distance: c_int, _failed: c_int) -> c_int {
    1
}

/// Registers a coarray and returns its storage; the handle is written to
/// `token`.
#[unsafe(export_name = "caf_register")]
pub unsafe extern "C" fn caf_register(
    size: usize,
    kind: c_int,
    token: *mut CafToken,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
    num_alloc_comps: c_int,
) -> *mut c_void {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let kind = RegistrationKind::from_code(kind)?;
        let handle = unsafe { token.as_mut() }.ok_or(CafError::NullArgument { name: "token" })?;
        let components = usize::try_from(num_alloc_comps).unwrap_or(0);
        let registration = runtime.register(size, kind, 1, components)?;
        *handle = CafToken::from_id(registration.token);
        Ok(registration.as_ptr() as *mut c_void)
    })
    .unwrap_or(ptr::null_mut())
}

#[unsafe(export_name = "caf_deregister")]
pub unsafe extern "C" fn caf_deregister(
    token: *mut CafToken,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let handle = unsafe { token.as_mut() }.ok_or(CafError::NullToken)?;
        let id = handle.id()?;
        runtime.deregister(id)?;
        *handle = CafToken::null();
        Ok(())
    });
}

#[unsafe(export_name = "caf_register_component")]
pub unsafe extern "C" fn caf_register_component(
    token: CafToken,
    kind: c_int,
    size: usize,
    comp_idx: c_int,
    descriptor: *mut Descriptor,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
    num_comp: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let parent = token.id()?;
        let kind = RegistrationKind::from_code(kind)?;
        let descriptor = unsafe { descriptor.as_mut() }.ok_or(CafError::MissingDescriptor)?;
        let subcomponents = usize::try_from(num_comp).unwrap_or(0);
        unsafe {
            runtime.register_component(
                parent,
                kind,
                size,
                component_index(comp_idx),
                descriptor,
                subcomponents,
            )?
        };
        Ok(())
    });
}

/// Deregisters a component; `component` is nulled when the runtime had
/// allocated its storage.
#[unsafe(export_name = "caf_deregister_component")]
pub unsafe extern "C" fn caf_deregister_component(
    token: CafToken,
    comp_num: c_int,
    component: *mut *mut c_void,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let parent = token.id()?;
        let index = component_index(comp_num);
        let registry = runtime.registry();
        let owned = match registry.component(parent, index)? {
            Some(child) => registry.record(child)?.owns_memory(),
            None => false,
        };
        runtime.deregister_component(parent, index)?;
        if owned {
            if let Some(slot) = unsafe { component.as_mut() } {
                *slot = ptr::null_mut();
            }
        }
        Ok(())
    });
}

#[unsafe(export_name = "caf_get")]
pub unsafe extern "C" fn caf_get(
    token: CafToken,
    offset: usize,
    image_index: c_int,
    src: *mut Descriptor,
    _src_vector: *mut c_void,
    dst: *mut Descriptor,
    src_kind: c_int,
    dst_kind: c_int,
    may_require_tmp: bool,
    stat: *mut c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        let id = token.id()?;
        let (src, dst) = unsafe { (retyped(src, src_kind)?, retyped(dst, dst_kind)?) };
        unsafe { runtime.get(id, offset, image_index, &dst, &src, may_require_tmp) }
    });
}

#[unsafe(export_name = "caf_send")]
pub unsafe extern "C" fn caf_send(
    token: CafToken,
    offset: usize,
    image_index: c_int,
    dst: *mut Descriptor,
    _dst_vector: *mut c_void,
    src: *mut Descriptor,
    dst_kind: c_int,
    src_kind: c_int,
    may_require_tmp: bool,
    stat: *mut c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        let id = token.id()?;
        let (dst, src) = unsafe { (retyped(dst, dst_kind)?, retyped(src, src_kind)?) };
        unsafe { runtime.send(id, offset, image_index, &dst, &src, may_require_tmp) }
    });
}

/// Coarray-to-coarray copy. There is no status channel; failures are fatal.
#[unsafe(export_name = "caf_sendget")]
pub unsafe extern "C" fn caf_sendget(
    dst_token: CafToken,
    dst_offset: usize,
    dst_image_index: c_int,
    dst: *mut Descriptor,
    _dst_vector: *mut c_void,
    src_token: CafToken,
    src_offset: usize,
    src_image_index: c_int,
    src: *mut Descriptor,
    _src_vector: *mut c_void,
    dst_kind: c_int,
    src_kind: c_int,
    may_require_tmp: bool,
) {
    with_state(None, |runtime| {
        let (dst, src) = unsafe { (retyped(dst, dst_kind)?, retyped(src, src_kind)?) };
        let dst = RemoteSection {
            token: dst_token.id()?,
            offset: dst_offset,
            image: dst_image_index,
            desc: &dst,
        };
        let src = RemoteSection {
            token: src_token.id()?,
            offset: src_offset,
            image: src_image_index,
            desc: &src,
        };
        unsafe { runtime.send_get(dst, src, may_require_tmp) }
    });
}

/// Reads through a reference chain. A destination allocated here belongs to
/// the caller, who releases it with `free`; the block it replaced is left
/// alone.
#[unsafe(export_name = "caf_get_by_ref")]
pub unsafe extern "C" fn caf_get_by_ref(
    token: CafToken,
    image_index: c_int,
    dst: *mut Descriptor,
    refs: *const RawReference,
    dst_kind: c_int,
    src_kind: c_int,
    may_require_tmp: bool,
    dst_reallocatable: bool,
    stat: *mut c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        let id = token.id()?;
        let chain = unsafe { decode_chain(refs)? };
        let dst = unsafe { dst.as_mut() }.ok_or(CafError::MissingDescriptor)?;
        let tag = dst.element_type()?.tag;
        dst.set_element_type(ElementType::new(tag, dst_kind));
        let options = TransferOptions {
            may_require_tmp,
            dst_reallocatable,
        };
        let src_type = ElementType::new(tag, src_kind);
        let fresh = unsafe { runtime.get_by_ref(id, image_index, dst, &chain, src_type, options)? };
        if let Some(storage) = fresh {
            let bytes = storage.len();
            let base = storage.into_raw();
            trace!(?base, bytes, "destination handed to the caller");
        }
        Ok(())
    });
}

#[unsafe(export_name = "caf_send_by_ref")]
pub unsafe extern "C" fn caf_send_by_ref(
    token: CafToken,
    image_index: c_int,
    src: *mut Descriptor,
    refs: *const RawReference,
    dst_kind: c_int,
    src_kind: c_int,
    may_require_tmp: bool,
    dst_reallocatable: bool,
    stat: *mut c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        let id = token.id()?;
        let chain = unsafe { decode_chain(refs)? };
        let src = unsafe { retyped(src, src_kind)? };
        let dst_type = ElementType::new(src.element_type()?.tag, dst_kind);
        let options = TransferOptions {
            may_require_tmp,
            dst_reallocatable,
        };
        unsafe { runtime.send_by_ref(id, image_index, &src, &chain, dst_type, options) }
    });
}

/// Chained coarray-to-coarray copy. Failures are reported through
/// `dst_stat`; `src_stat` is cleared when given.
#[unsafe(export_name = "caf_sendget_by_ref")]
pub unsafe extern "C" fn caf_sendget_by_ref(
    dst_token: CafToken,
    dst_image_index: c_int,
    dst_refs: *const RawReference,
    src_token: CafToken,
    src_image_index: c_int,
    src_refs: *const RawReference,
    dst_kind: c_int,
    src_kind: c_int,
    may_require_tmp: bool,
    dst_stat: *mut c_int,
    src_stat: *mut c_int,
    dst_type: c_int,
    src_type: c_int,
) {
    if let Some(stat) = unsafe { src_stat.as_mut() } {
        *stat = 0;
    }
    let status = unsafe { status_from(dst_stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        let dst_chain = unsafe { decode_chain(dst_refs)? };
        let src_chain = unsafe { decode_chain(src_refs)? };
        let dst = RemoteRef {
            token: dst_token.id()?,
            image: dst_image_index,
            chain: &dst_chain,
            ty: ElementType::from_raw(dst_type, dst_kind)?,
        };
        let src = RemoteRef {
            token: src_token.id()?,
            image: src_image_index,
            chain: &src_chain,
            ty: ElementType::from_raw(src_type, src_kind)?,
        };
        unsafe { runtime.send_get_by_ref(dst, src, may_require_tmp) }
    });
}

#[unsafe(export_name = "caf_atomic_define")]
pub unsafe extern "C" fn caf_atomic_define(
    token: CafToken,
    offset: usize,
    image_index: c_int,
    value: *const c_void,
    stat: *mut c_int,
    _type: c_int,
    kind: c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        atomic_kind(kind)?;
        let value = unsafe { read_word(value, "value")? };
        runtime.atomic_define(token.id()?, offset, image_index, value)
    });
}

#[unsafe(export_name = "caf_atomic_ref")]
pub unsafe extern "C" fn caf_atomic_ref(
    token: CafToken,
    offset: usize,
    image_index: c_int,
    value: *mut c_void,
    stat: *mut c_int,
    _type: c_int,
    kind: c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        atomic_kind(kind)?;
        if value.is_null() {
            return Err(CafError::NullArgument { name: "value" });
        }
        let current = runtime.atomic_ref(token.id()?, offset, image_index)?;
        unsafe { write_word(value, current) };
        Ok(())
    });
}

/// Writes the cell's value before the exchange to `old`.
#[unsafe(export_name = "caf_atomic_cas")]
pub unsafe extern "C" fn caf_atomic_cas(
    token: CafToken,
    offset: usize,
    image_index: c_int,
    old: *mut c_void,
    compare: *const c_void,
    new_val: *const c_void,
    stat: *mut c_int,
    _type: c_int,
    kind: c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        atomic_kind(kind)?;
        let compare = unsafe { read_word(compare, "compare")? };
        let new = unsafe { read_word(new_val, "new_val")? };
        let previous = runtime.atomic_cas(token.id()?, offset, image_index, compare, new)?;
        unsafe { write_word(old, previous) };
        Ok(())
    });
}

#[unsafe(export_name = "caf_atomic_op")]
pub unsafe extern "C" fn caf_atomic_op(
    op: c_int,
    token: CafToken,
    offset: usize,
    image_index: c_int,
    value: *const c_void,
    old: *mut c_void,
    stat: *mut c_int,
    _type: c_int,
    kind: c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        atomic_kind(kind)?;
        let op = AtomicOp::from_code(op)?;
        let value = unsafe { read_word(value, "value")? };
        let previous = runtime.atomic_op(op, token.id()?, offset, image_index, value)?;
        unsafe { write_word(old, previous) };
        Ok(())
    });
}

#[unsafe(export_name = "caf_event_post")]
pub unsafe extern "C" fn caf_event_post(
    token: CafToken,
    index: usize,
    image_index: c_int,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let offset = index.saturating_mul(ATOMIC_CELL);
        runtime.event_post(token.id()?, offset, image_index)
    });
}

#[unsafe(export_name = "caf_event_wait")]
pub unsafe extern "C" fn caf_event_wait(
    token: CafToken,
    index: usize,
    until_count: c_int,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let offset = index.saturating_mul(ATOMIC_CELL);
        let until_count = u32::try_from(until_count).unwrap_or(0);
        runtime.event_wait(token.id()?, offset, until_count)
    });
}

#[unsafe(export_name = "caf_event_query")]
pub unsafe extern "C" fn caf_event_query(
    token: CafToken,
    index: usize,
    image_index: c_int,
    count: *mut c_int,
    stat: *mut c_int,
) {
    let status = unsafe { status_from(stat, ptr::null_mut(), 0) };
    with_state(status, |runtime| {
        let slot = unsafe { count.as_mut() }.ok_or(CafError::NullArgument { name: "count" })?;
        let offset = index.saturating_mul(ATOMIC_CELL);
        let value = runtime.event_query(token.id()?, offset, image_index)?;
        *slot = c_int::try_from(value).unwrap_or(c_int::MAX);
        Ok(())
    });
}

#[unsafe(export_name = "caf_lock")]
pub unsafe extern "C" fn caf_lock(
    token: CafToken,
    index: usize,
    image_index: c_int,
    acquired_lock: *mut c_int,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let id = token.id()?;
        match unsafe { acquired_lock.as_mut() } {
            Some(slot) => {
                let mut acquired = false;
                runtime.lock(id, index, image_index, Some(&mut acquired))?;
                *slot = c_int::from(acquired);
                Ok(())
            }
            None => runtime.lock(id, index, image_index, None),
        }
    });
}

#[unsafe(export_name = "caf_unlock")]
pub unsafe extern "C" fn caf_unlock(
    token: CafToken,
    index: usize,
    image_index: c_int,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| runtime.unlock(token.id()?, index, image_index));
}

#[unsafe(export_name = "caf_sync_all")]
pub unsafe extern "C" fn caf_sync_all(stat: *mut c_int, errmsg: *mut c_char, errmsg_len: c_int) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| runtime.sync_all());
}

#[unsafe(export_name = "caf_sync_memory")]
pub unsafe extern "C" fn caf_sync_memory(stat: *mut c_int, errmsg: *mut c_char, errmsg_len: c_int) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| runtime.sync_memory());
}

/// `count < 0` means all images.
#[unsafe(export_name = "caf_sync_images")]
pub unsafe extern "C" fn caf_sync_images(
    count: c_int,
    images: *const c_int,
    stat: *mut c_int,
    errmsg: *mut c_char,
    errmsg_len: c_int,
) {
    let status = unsafe { status_from(stat, errmsg, errmsg_len) };
    with_state(status, |runtime| {
        let images: &[c_int] = match usize::try_from(count) {
            Ok(len) if len > 0 && !images.is_null() => unsafe { slice::from_raw_parts(images, len) },
            _ => &[],
        };
        runtime.sync_images(images)
    });
}
