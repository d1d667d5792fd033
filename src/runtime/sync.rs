//! Atomics, events and locks over coarray storage. With a single image
//! every cell is local; operations are plain atomics on the token memory.

use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use tracing::trace;

use crate::runtime::Runtime;
use crate::runtime::error::{CafError, CafResult};
use crate::runtime::registry::TokenId;

/// Width of an atomic or event cell.
pub const ATOMIC_CELL: usize = 4;
/// Width of a lock cell.
pub const LOCK_CELL: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Add,
    And,
    Or,
    Xor,
}

impl AtomicOp {
    pub fn from_code(code: i32) -> CafResult<Self> {
        match code {
            1 => Ok(AtomicOp::Add),
            2 => Ok(AtomicOp::And),
            3 => Ok(AtomicOp::Or),
            4 => Ok(AtomicOp::Xor),
            _ => Err(CafError::UnknownAtomicOperation { code }),
        }
    }
}

impl Runtime {
    fn cell(&self, token: TokenId, offset: usize, width: usize) -> CafResult<*mut u8> {
        let record = self.registry.record(token)?;
        let size = record.len();
        if offset.checked_add(width).is_none_or(|end| end > size) {
            return Err(CafError::OutOfBounds {
                offset: offset as isize,
                len: width,
                size,
            });
        }
        let ptr = record.memory_ptr().wrapping_add(offset);
        if ptr as usize % width != 0 {
            return Err(CafError::MisalignedAtomic {
                offset,
                align: width,
            });
        }
        Ok(ptr)
    }

    fn atomic_cell(&self, token: TokenId, offset: usize) -> CafResult<&AtomicU32> {
        let ptr = self.cell(token, offset, ATOMIC_CELL)?;
        // In bounds and aligned; the registration outlives the borrow of self.
        Ok(unsafe { AtomicU32::from_ptr(ptr as *mut u32) })
    }

    fn lock_cell(&self, token: TokenId, offset: usize) -> CafResult<&AtomicU8> {
        let ptr = self.cell(token, offset, LOCK_CELL)?;
        Ok(unsafe { AtomicU8::from_ptr(ptr) })
    }

    pub fn atomic_define(&self, token: TokenId, offset: usize, image: i32, value: u32) -> CafResult<()> {
        self.check_image(image)?;
        self.atomic_cell(token, offset)?.store(value, Ordering::Relaxed);
        Ok(())
    }

    pub fn atomic_ref(&self, token: TokenId, offset: usize, image: i32) -> CafResult<u32> {
        self.check_image(image)?;
        Ok(self.atomic_cell(token, offset)?.load(Ordering::Relaxed))
    }

    /// Stores `new` if the cell holds `compare`; returns the previous value.
    pub fn atomic_cas(
        &self,
        token: TokenId,
        offset: usize,
        image: i32,
        compare: u32,
        new: u32,
    ) -> CafResult<u32> {
        self.check_image(image)?;
        let cell = self.atomic_cell(token, offset)?;
        let old = match cell.compare_exchange(compare, new, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(old) | Err(old) => old,
        };
        Ok(old)
    }

    /// Applies `op` with `value`; returns the previous value.
    pub fn atomic_op(
        &self,
        op: AtomicOp,
        token: TokenId,
        offset: usize,
        image: i32,
        value: u32,
    ) -> CafResult<u32> {
        self.check_image(image)?;
        let cell = self.atomic_cell(token, offset)?;
        let old = match op {
            AtomicOp::Add => cell.fetch_add(value, Ordering::Relaxed),
            AtomicOp::And => cell.fetch_and(value, Ordering::Relaxed),
            AtomicOp::Or => cell.fetch_or(value, Ordering::Relaxed),
            AtomicOp::Xor => cell.fetch_xor(value, Ordering::Relaxed),
        };
        Ok(old)
    }

    pub fn event_post(&self, token: TokenId, offset: usize, image: i32) -> CafResult<()> {
        self.check_image(image)?;
        let cell = self.atomic_cell(token, offset)?;
        let _ = cell.fetch_update(Ordering::Release, Ordering::Relaxed, |count| {
            Some(count.saturating_add(1))
        });
        trace!(%token, offset, "event posted");
        Ok(())
    }

    /// Consumes `until_count` posts. Nothing else can post on a single
    /// image, so this never blocks; the count bottoms out at zero.
    pub fn event_wait(&self, token: TokenId, offset: usize, until_count: u32) -> CafResult<()> {
        let cell = self.atomic_cell(token, offset)?;
        let _ = cell.fetch_update(Ordering::Acquire, Ordering::Relaxed, |count| {
            Some(count.saturating_sub(until_count))
        });
        trace!(%token, offset, until_count, "event waited");
        Ok(())
    }

    pub fn event_query(&self, token: TokenId, offset: usize, image: i32) -> CafResult<u32> {
        self.check_image(image)?;
        Ok(self.atomic_cell(token, offset)?.load(Ordering::Acquire))
    }

    /// Acquires the lock cell. When the lock is held, reports through
    /// `acquired` if given, otherwise fails with [`CafError::AlreadyLocked`].
    pub fn lock(
        &self,
        token: TokenId,
        offset: usize,
        image: i32,
        acquired: Option<&mut bool>,
    ) -> CafResult<()> {
        self.check_image(image)?;
        let cell = self.lock_cell(token, offset)?;
        let taken = cell
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        trace!(%token, offset, taken, "lock");
        match acquired {
            Some(flag) => {
                *flag = taken;
                Ok(())
            }
            None if taken => Ok(()),
            None => Err(CafError::AlreadyLocked),
        }
    }

    pub fn unlock(&self, token: TokenId, offset: usize, image: i32) -> CafResult<()> {
        self.check_image(image)?;
        let cell = self.lock_cell(token, offset)?;
        if cell
            .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return Err(CafError::NotLocked);
        }
        trace!(%token, offset, "unlock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::runtime::Registration;
    use crate::runtime::registry::RegistrationKind;

    fn runtime_with(kind: RegistrationKind, size: usize, unit: usize) -> (Runtime, Registration) {
        let mut runtime = Runtime::new(RuntimeConfig::default());
        let reg = runtime.register(size, kind, unit, 0).unwrap();
        (runtime, reg)
    }

    #[test]
    fn atomic_operations_return_previous_values() {
        let (runtime, reg) = runtime_with(RegistrationKind::CoarrayAlloc, 8, 1);
        let token = reg.token;
        runtime.atomic_define(token, 4, 1, 0b1100).unwrap();
        assert_eq!(runtime.atomic_op(AtomicOp::Add, token, 4, 1, 1).unwrap(), 0b1100);
        assert_eq!(runtime.atomic_op(AtomicOp::And, token, 4, 1, 0b0101).unwrap(), 0b1101);
        assert_eq!(runtime.atomic_op(AtomicOp::Or, token, 4, 1, 0b0010).unwrap(), 0b0101);
        assert_eq!(runtime.atomic_op(AtomicOp::Xor, token, 4, 1, 0b1111).unwrap(), 0b0111);
        assert_eq!(runtime.atomic_ref(token, 4, 1).unwrap(), 0b1000);
    }

    #[test]
    fn compare_and_swap_only_swaps_on_match() {
        let (runtime, reg) = runtime_with(RegistrationKind::CoarrayAlloc, 4, 1);
        let token = reg.token;
        runtime.atomic_define(token, 0, 1, 5).unwrap();
        assert_eq!(runtime.atomic_cas(token, 0, 1, 4, 9).unwrap(), 5);
        assert_eq!(runtime.atomic_ref(token, 0, 1).unwrap(), 5);
        assert_eq!(runtime.atomic_cas(token, 0, 1, 5, 9).unwrap(), 5);
        assert_eq!(runtime.atomic_ref(token, 0, 1).unwrap(), 9);
    }

    #[test]
    fn unknown_operation_codes_are_rejected() {
        assert_eq!(AtomicOp::from_code(3), Ok(AtomicOp::Or));
        assert_eq!(
            AtomicOp::from_code(7),
            Err(CafError::UnknownAtomicOperation { code: 7 })
        );
    }

    #[test]
    fn atomics_are_bounds_and_alignment_checked() {
        let (runtime, reg) = runtime_with(RegistrationKind::CoarrayAlloc, 8, 1);
        let token = reg.token;
        assert_eq!(
            runtime.atomic_ref(token, 6, 1),
            Err(CafError::OutOfBounds {
                offset: 6,
                len: 4,
                size: 8
            })
        );
        assert_eq!(
            runtime.atomic_ref(token, 2, 1),
            Err(CafError::MisalignedAtomic { offset: 2, align: 4 })
        );
    }

    #[test]
    fn events_count_posts_and_waits() {
        let (runtime, reg) = runtime_with(RegistrationKind::EventAlloc, 2, 4);
        let token = reg.token;
        runtime.event_post(token, 4, 1).unwrap();
        runtime.event_post(token, 4, 1).unwrap();
        runtime.event_post(token, 4, 1).unwrap();
        assert_eq!(runtime.event_query(token, 4, 1).unwrap(), 3);
        assert_eq!(runtime.event_query(token, 0, 1).unwrap(), 0);
        runtime.event_wait(token, 4, 2).unwrap();
        assert_eq!(runtime.event_query(token, 4, 1).unwrap(), 1);
        runtime.event_wait(token, 4, 5).unwrap();
        assert_eq!(runtime.event_query(token, 4, 1).unwrap(), 0);
    }

    #[test]
    fn locking_twice_fails_or_reports() {
        let (runtime, reg) = runtime_with(RegistrationKind::LockAlloc, 3, 1);
        let token = reg.token;
        runtime.lock(token, 1, 1, None).unwrap();
        let mut acquired = true;
        runtime.lock(token, 1, 1, Some(&mut acquired)).unwrap();
        assert!(!acquired);
        assert_eq!(runtime.lock(token, 1, 1, None), Err(CafError::AlreadyLocked));
        runtime.unlock(token, 1, 1).unwrap();
        assert_eq!(runtime.unlock(token, 1, 1), Err(CafError::NotLocked));
        runtime.lock(token, 2, 1, Some(&mut acquired)).unwrap();
        assert!(acquired);
    }
}
