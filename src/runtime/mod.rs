pub mod abi;
pub mod alloc;
pub mod error;
pub mod registry;
pub mod status;
pub mod sync;
pub mod transfer;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use tracing::{debug, trace};

use crate::config::RuntimeConfig;
use crate::descriptor::Descriptor;
use crate::runtime::alloc::{Allocator, SystemAllocator};
use crate::runtime::error::{CafError, CafResult};
use crate::runtime::registry::{DescriptorSlot, RegistrationKind, Registry, TokenId};

/// A registered top-level coarray: its handle and the address of its
/// storage. The runtime owns the storage until the token is deregistered.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    pub token: TokenId,
    memory: NonNull<u8>,
    len: usize,
}

impl Registration {
    pub fn as_ptr(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// `token` must still be registered and nothing may write the storage
    /// while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.memory.as_ptr(), self.len) }
    }

    /// # Safety
    /// `token` must still be registered and the storage must not be reached
    /// any other way while the slice is alive.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.memory.as_ptr(), self.len) }
    }
}

/// Single-image coarray runtime. Every image-indexed operation resolves to
/// local memory; synchronization degenerates to memory fences.
pub struct Runtime {
    registry: Registry,
    statics: Vec<TokenId>,
    config: RuntimeConfig,
    finalized: bool,
}

// SAFETY: the registry only holds pointers into storage owned by the runtime
// or lent to it by the caller for the lifetime of a registration.
unsafe impl Send for Runtime {}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_allocator(config, Arc::new(SystemAllocator))
    }

    pub fn with_allocator(config: RuntimeConfig, allocator: Arc<dyn Allocator>) -> Self {
        debug!(?config, "coarray runtime initialized");
        Self {
            registry: Registry::new(allocator),
            statics: Vec::new(),
            config,
            finalized: false,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn this_image(&self) -> i32 {
        1
    }

    pub fn num_images(&self) -> i32 {
        1
    }

    /// Validates an image index when runtime checks are enabled; otherwise
    /// every index means the local image.
    pub fn check_image(&self, image: i32) -> CafResult<()> {
        if self.config.runtime_checks && image != 1 {
            return Err(CafError::InvalidImage { image });
        }
        Ok(())
    }

    pub fn sync_all(&self) -> CafResult<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    pub fn sync_memory(&self) -> CafResult<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }

    pub fn sync_images(&self, images: &[i32]) -> CafResult<()> {
        for &image in images {
            self.check_image(image)?;
        }
        fence(Ordering::SeqCst);
        Ok(())
    }

    /// Registers a coarray of `size` bytes, or `size` cells of `unit_size`
    /// bytes for lock, critical and event kinds.
    pub fn register(
        &mut self,
        size: usize,
        kind: RegistrationKind,
        unit_size: usize,
        num_components: usize,
    ) -> CafResult<Registration> {
        let token = self.registry.register(size, kind, unit_size, num_components)?;
        let record = self.registry.record(token)?;
        let registration = Registration {
            token,
            memory: record.memory_non_null(),
            len: record.len(),
        };
        if kind.is_static() {
            self.statics.push(token);
        }
        Ok(registration)
    }

    /// Registers allocatable component `index` of `parent`, allocating its
    /// storage when `descriptor` has none.
    ///
    /// # Safety
    /// `descriptor`, and any storage it already points at, must stay valid
    /// and must not move until the component is deregistered.
    pub unsafe fn register_component(
        &mut self,
        parent: TokenId,
        kind: RegistrationKind,
        size: usize,
        index: usize,
        descriptor: &mut Descriptor,
        num_subcomponents: usize,
    ) -> CafResult<TokenId> {
        self.registry.register_component(
            parent,
            kind,
            size,
            index,
            DescriptorSlot::borrowed(NonNull::from(descriptor)),
            num_subcomponents,
        )
    }

    /// Releases a top-level coarray, its storage and its components.
    pub fn deregister(&mut self, token: TokenId) -> CafResult<()> {
        self.registry.deregister(token)?;
        self.statics.retain(|t| *t != token);
        Ok(())
    }

    pub fn deregister_component(&mut self, parent: TokenId, index: usize) -> CafResult<()> {
        self.registry.deregister_component(parent, index)
    }

    /// Deregisters every static registration still alive. Idempotent.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        for token in std::mem::take(&mut self.statics) {
            if let Err(error) = self.registry.deregister(token) {
                trace!(%token, %error, "static token already gone at finalize");
            }
        }
        debug!(live = self.registry.live_tokens(), "coarray runtime finalized");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::alloc::TrackingAllocator;

    #[test]
    fn single_image_queries() {
        let runtime = Runtime::new(RuntimeConfig::default());
        assert_eq!(runtime.this_image(), 1);
        assert_eq!(runtime.num_images(), 1);
        assert!(runtime.sync_all().is_ok());
        assert!(runtime.sync_memory().is_ok());
        assert!(runtime.sync_images(&[1, 2]).is_ok());
    }

    #[test]
    fn runtime_checks_reject_remote_images() {
        let config = RuntimeConfig {
            runtime_checks: true,
            ..RuntimeConfig::default()
        };
        let runtime = Runtime::new(config);
        assert!(runtime.check_image(1).is_ok());
        assert_eq!(
            runtime.sync_images(&[1, 3]),
            Err(CafError::InvalidImage { image: 3 })
        );
    }

    #[test]
    fn storage_lives_until_deregistration() {
        let tracker = Arc::new(TrackingAllocator::new());
        let mut runtime = Runtime::with_allocator(RuntimeConfig::default(), tracker.clone());
        let reg = runtime
            .register(8, RegistrationKind::CoarrayAlloc, 1, 0)
            .unwrap();
        runtime.atomic_define(reg.token, 4, 1, 7).unwrap();
        assert_eq!(unsafe { reg.as_slice() }[4..], 7u32.to_ne_bytes());
        assert_eq!(tracker.live_allocations(), 1);

        runtime.deregister(reg.token).unwrap();
        assert_eq!(tracker.live_allocations(), 0);
        let stale = Err(CafError::InvalidToken { token: reg.token });
        assert_eq!(runtime.atomic_define(reg.token, 4, 1, 8), stale);
        assert_eq!(runtime.lock(reg.token, 0, 1, None), stale);
    }

    #[test]
    fn finalize_releases_static_registrations() {
        let tracker = Arc::new(TrackingAllocator::new());
        let mut runtime = Runtime::with_allocator(RuntimeConfig::default(), tracker.clone());
        let fixed = runtime
            .register(8, RegistrationKind::CoarrayStatic, 1, 0)
            .unwrap();
        let dynamic = runtime
            .register(8, RegistrationKind::CoarrayAlloc, 1, 0)
            .unwrap();
        assert_eq!(runtime.registry().live_tokens(), 2);
        runtime.finalize();
        assert!(runtime.registry().record(fixed.token).is_err());
        assert!(runtime.registry().record(dynamic.token).is_ok());
        assert_eq!(tracker.live_allocations(), 1);
        runtime.finalize();
        drop(runtime);
        assert_eq!(tracker.live_allocations(), 0);
    }
}
