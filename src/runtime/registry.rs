//! Token arena: one record per registered coarray or allocatable component.
//!
//! Tokens are generational handles into a slot vector, so a handle that
//! outlives its registration is rejected instead of aliasing a newer one.

use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::descriptor::Descriptor;
use crate::runtime::alloc::{Allocation, Allocator, Memory};
use crate::runtime::error::{CafError, CafResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId {
    index: u32,
    generation: u32,
}

impl TokenId {
    /// Packs the handle into a non-zero integer for the C ABI.
    pub fn to_bits(self) -> u64 {
        ((u64::from(self.generation)) << 32) | (u64::from(self.index) + 1)
    }

    pub fn from_bits(bits: u64) -> Option<Self> {
        let low = (bits & 0xffff_ffff) as u32;
        let index = low.checked_sub(1)?;
        Some(Self {
            index,
            generation: (bits >> 32) as u32,
        })
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationKind {
    CoarrayStatic,
    CoarrayAlloc,
    LockStatic,
    LockAlloc,
    Critical,
    EventStatic,
    EventAlloc,
}

impl RegistrationKind {
    pub fn from_code(code: i32) -> CafResult<Self> {
        Ok(match code {
            0 => RegistrationKind::CoarrayStatic,
            1 => RegistrationKind::CoarrayAlloc,
            2 => RegistrationKind::LockStatic,
            3 => RegistrationKind::LockAlloc,
            4 => RegistrationKind::Critical,
            5 => RegistrationKind::EventStatic,
            6 => RegistrationKind::EventAlloc,
            _ => return Err(CafError::UnknownRegistrationKind { code }),
        })
    }

    /// Lock, critical and event storage is sized in cells and zero-filled.
    pub fn is_synchronization(self) -> bool {
        !matches!(
            self,
            RegistrationKind::CoarrayStatic | RegistrationKind::CoarrayAlloc
        )
    }

    /// Registrations that live until the runtime is finalized.
    pub fn is_static(self) -> bool {
        matches!(
            self,
            RegistrationKind::CoarrayStatic
                | RegistrationKind::LockStatic
                | RegistrationKind::Critical
                | RegistrationKind::EventStatic
                | RegistrationKind::EventAlloc
        )
    }
}

/// Where a token's array descriptor lives: caller-provided (typically
/// embedded in the parent's storage) or created by the runtime for a
/// component it allocated on demand.
#[derive(Debug)]
pub(crate) struct DescriptorSlot {
    ptr: NonNull<Descriptor>,
    owned: bool,
}

impl DescriptorSlot {
    pub(crate) fn borrowed(ptr: NonNull<Descriptor>) -> Self {
        Self { ptr, owned: false }
    }

    pub(crate) fn owned(descriptor: Descriptor) -> Self {
        Self {
            ptr: NonNull::from(Box::leak(Box::new(descriptor))),
            owned: true,
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut Descriptor {
        self.ptr.as_ptr()
    }
}

impl Drop for DescriptorSlot {
    fn drop(&mut self) {
        if self.owned {
            drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        }
    }
}

#[derive(Debug)]
pub struct TokenRecord {
    memory: Memory,
    descriptor: Option<DescriptorSlot>,
    components: Vec<Option<TokenId>>,
    kind: RegistrationKind,
    parent: Option<TokenId>,
    /// Pointer-sized field in the parent that holds this component's data
    /// pointer, for scalar components allocated on demand.
    published: Option<NonNull<u8>>,
}

impl TokenRecord {
    pub fn memory_ptr(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    pub(crate) fn memory_non_null(&self) -> NonNull<u8> {
        self.memory.as_non_null()
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    pub fn owns_memory(&self) -> bool {
        self.memory.is_owned()
    }

    pub fn kind(&self) -> RegistrationKind {
        self.kind
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }

    pub fn parent(&self) -> Option<TokenId> {
        self.parent
    }

    pub(crate) fn descriptor_ptr(&self) -> Option<*mut Descriptor> {
        self.descriptor.as_ref().map(DescriptorSlot::as_ptr)
    }

    pub fn descriptor(&self) -> Option<Descriptor> {
        self.descriptor_ptr()
            .map(|ptr| unsafe { Descriptor::load(ptr) })
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<TokenRecord>,
}

pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    allocator: Arc<dyn Allocator>,
}

impl Registry {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            allocator,
        }
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn live_tokens(&self) -> usize {
        self.slots.iter().filter(|slot| slot.record.is_some()).count()
    }

    pub fn record(&self, token: TokenId) -> CafResult<&TokenRecord> {
        self.slots
            .get(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.record.as_ref())
            .ok_or(CafError::InvalidToken { token })
    }

    pub(crate) fn record_mut(&mut self, token: TokenId) -> CafResult<&mut TokenRecord> {
        self.slots
            .get_mut(token.index as usize)
            .filter(|slot| slot.generation == token.generation)
            .and_then(|slot| slot.record.as_mut())
            .ok_or(CafError::InvalidToken { token })
    }

    fn insert(&mut self, record: TokenRecord) -> TokenId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            return TokenId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            record: Some(record),
        });
        TokenId {
            index,
            generation: 0,
        }
    }

    fn remove(&mut self, token: TokenId) -> CafResult<TokenRecord> {
        self.record(token)?;
        let slot = &mut self.slots[token.index as usize];
        let record = slot.record.take().ok_or(CafError::InvalidToken { token })?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(token.index);
        Ok(record)
    }

    fn component_table(count: usize) -> CafResult<Vec<Option<TokenId>>> {
        let mut components = Vec::new();
        components
            .try_reserve_exact(count)
            .map_err(|_| CafError::allocation(count.saturating_mul(std::mem::size_of::<Option<TokenId>>())))?;
        components.resize(count, None);
        Ok(components)
    }

    /// Registers a top-level coarray. The record owns its storage until the
    /// token is deregistered.
    pub fn register(
        &mut self,
        size: usize,
        kind: RegistrationKind,
        unit_size: usize,
        num_components: usize,
    ) -> CafResult<TokenId> {
        let bytes = if kind.is_synchronization() {
            size.checked_mul(unit_size.max(1))
                .ok_or(CafError::allocation(usize::MAX))?
        } else {
            size
        };
        let memory = Memory::Owned(Allocation::new(&self.allocator, bytes)?);
        let components = Self::component_table(num_components)?;
        let record = TokenRecord {
            memory,
            descriptor: None,
            components,
            kind,
            parent: None,
            published: None,
        };
        let token = self.insert(record);
        debug!(%token, bytes, ?kind, num_components, "registered coarray");
        Ok(token)
    }

    /// Registers allocatable component `index` of `parent`. Storage is
    /// allocated, and published through the descriptor, only when the
    /// descriptor has none yet.
    pub(crate) fn register_component(
        &mut self,
        parent: TokenId,
        kind: RegistrationKind,
        size: usize,
        index: usize,
        descriptor: DescriptorSlot,
        num_subcomponents: usize,
    ) -> CafResult<TokenId> {
        let count = self.record(parent)?.components.len();
        if index >= count {
            return Err(CafError::ComponentIndexOutOfRange { index, count });
        }
        if self.record(parent)?.components[index].is_some() {
            return Err(CafError::ComponentAlreadyRegistered { index });
        }
        let desc_ptr = descriptor.as_ptr();
        let existing = unsafe { Descriptor::load(desc_ptr) }.base_addr;
        let memory = match NonNull::new(existing) {
            Some(ptr) => Memory::Borrowed { ptr, len: size },
            None => Memory::Owned(Allocation::new(&self.allocator, size)?),
        };
        let components = Self::component_table(num_subcomponents)?;
        if let Memory::Owned(allocation) = &memory {
            let mut desc = unsafe { Descriptor::load(desc_ptr) };
            desc.base_addr = allocation.as_ptr();
            unsafe { desc.store(desc_ptr) };
        }
        let owned = memory.is_owned();
        let child = self.insert(TokenRecord {
            memory,
            descriptor: Some(descriptor),
            components,
            kind,
            parent: Some(parent),
            published: None,
        });
        self.record_mut(parent)?.components[index] = Some(child);
        debug!(%parent, %child, index, size, owned, "registered component");
        Ok(child)
    }

    pub fn component(&self, parent: TokenId, index: usize) -> CafResult<Option<TokenId>> {
        let components = &self.record(parent)?.components;
        components
            .get(index)
            .copied()
            .ok_or(CafError::ComponentIndexOutOfRange {
                index,
                count: components.len(),
            })
    }

    /// Releases top-level `token`, its storage and all of its registered
    /// components. Memory the runtime does not own is left alone.
    pub fn deregister(&mut self, token: TokenId) -> CafResult<()> {
        let record = self.record(token)?;
        if record.parent.is_some() {
            return Err(CafError::ComponentToken { token });
        }
        let count = record.components.len();
        for index in 0..count {
            self.deregister_component(token, index)?;
        }
        let record = self.remove(token)?;
        debug!(%token, owned = record.owns_memory(), "deregistered coarray");
        Ok(())
    }

    /// Releases component `index` of `parent` and its subtree, freeing the
    /// storage and clearing the descriptor's data pointer when the runtime
    /// allocated it. An empty slot is a no-op.
    pub fn deregister_component(&mut self, parent: TokenId, index: usize) -> CafResult<()> {
        let Some(child) = self.component(parent, index)? else {
            return Ok(());
        };
        let count = self.record(child)?.components.len();
        for sub in 0..count {
            self.deregister_component(child, sub)?;
        }
        let record = self.remove(child)?;
        if record.owns_memory() {
            if let Some(desc_ptr) = record.descriptor_ptr() {
                let mut desc = unsafe { Descriptor::load(desc_ptr) };
                desc.base_addr = ptr::null_mut();
                unsafe { desc.store(desc_ptr) };
            }
            if let Some(slot) = record.published {
                unsafe { ptr::write_unaligned(slot.as_ptr() as *mut *mut u8, ptr::null_mut()) };
            }
        }
        trace!(%parent, %child, index, "deregistered component");
        self.record_mut(parent)?.components[index] = None;
        Ok(())
    }

    /// Writes the data pointer of component `token` into `slot`, a
    /// pointer-sized field of its parent. Deregistration clears it again.
    ///
    /// # Safety
    /// `slot` must stay writable for as long as the parent is registered.
    pub(crate) unsafe fn publish(&mut self, token: TokenId, slot: NonNull<u8>) -> CafResult<()> {
        let record = self.record_mut(token)?;
        unsafe { ptr::write_unaligned(slot.as_ptr() as *mut *mut u8, record.memory_ptr()) };
        record.published = Some(slot);
        Ok(())
    }

    /// Replaces the storage of `token` with a fresh runtime-owned block of
    /// `size` bytes, releasing the previous block if the runtime owned it.
    pub(crate) fn reallocate(&mut self, token: TokenId, size: usize) -> CafResult<*mut u8> {
        let allocation = Allocation::new(&self.allocator, size)?;
        let ptr = allocation.as_ptr();
        let record = self.record_mut(token)?;
        record.memory = Memory::Owned(allocation);
        debug!(%token, size, "reallocated component storage");
        Ok(ptr)
    }
}
