use std::ffi::{c_char, c_int, c_void};
use std::mem::size_of;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::descriptor::{Descriptor, ElementType, MAX_DIMENSIONS};
use crate::reference::raw::{
    ARR_REF_FULL, ARR_REF_NONE, RAW_REFERENCE_VERSION, REF_ARRAY, REF_COMPONENT, RawArray,
    RawComponent, RawDimension, RawReference, RawReferenceData, RawTriplet,
};
use crate::runtime::abi::*;

// The entry points share one process-wide runtime.
static SERIAL: Mutex<()> = Mutex::new(());

fn session() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    unsafe { caf_init(ptr::null_mut(), ptr::null_mut()) };
    guard
}

const COARRAY_ALLOC: c_int = 1;
const LOCK_ALLOC: c_int = 3;
const EVENT_ALLOC: c_int = 6;

fn register(size: usize, kind: c_int, components: c_int) -> (CafToken, *mut u8) {
    let mut token = CafToken::null();
    let mut stat = -1;
    let memory = unsafe {
        caf_register(size, kind, &mut token, &mut stat, ptr::null_mut(), 0, components)
    };
    assert_eq!(stat, 0);
    assert!(!token.is_null());
    (token, memory as *mut u8)
}

fn deregister(token: &mut CafToken) {
    let mut stat = -1;
    unsafe { caf_deregister(token, &mut stat, ptr::null_mut(), 0) };
    assert_eq!(stat, 0);
    assert!(token.is_null());
}

fn ints(values: &mut [i32]) -> Descriptor {
    Descriptor::array(
        ElementType::integer(4),
        4,
        values.as_mut_ptr() as *mut u8,
        &[(1, values.len() as isize)],
    )
    .unwrap()
}

#[test]
fn image_queries_are_constant() {
    assert_eq!(caf_this_image(0), 1);
    assert_eq!(caf_num_images(0, 0), 1);
}

#[test]
fn send_and_get_through_the_c_interface() {
    let _session = session();
    let (mut token, memory) = register(16, COARRAY_ALLOC, 0);
    let mut values = [7, 8, 9];
    let mut local = ints(&mut values);
    let local: *mut Descriptor = &mut local;
    let mut stat = -1;
    unsafe { caf_send(token, 4, 1, local, ptr::null_mut(), local, 4, 4, false, &mut stat) };
    assert_eq!(stat, 0);
    assert_eq!(unsafe { (memory.add(8) as *const i32).read() }, 8);

    let mut back = [0i32; 3];
    let mut dst = ints(&mut back);
    unsafe { caf_get(token, 4, 1, local, ptr::null_mut(), &mut dst, 4, 4, true, &mut stat) };
    assert_eq!(stat, 0);
    assert_eq!(back, [7, 8, 9]);

    unsafe { caf_send(token, 8, 1, local, ptr::null_mut(), local, 4, 4, false, &mut stat) };
    assert_eq!(stat, 1);

    deregister(&mut token);
    unsafe { caf_finalize() };
}

#[test]
fn lock_reports_through_acquired_or_stat() {
    let _session = session();
    let (mut token, _) = register(2, LOCK_ALLOC, 0);
    let mut stat = -1;
    let mut errmsg = [0 as c_char; 16];
    let errmsg_ptr = errmsg.as_mut_ptr();

    unsafe { caf_lock(token, 1, 1, ptr::null_mut(), &mut stat, errmsg_ptr, 16) };
    assert_eq!(stat, 0);

    let mut acquired: c_int = -1;
    unsafe { caf_lock(token, 1, 1, &mut acquired, &mut stat, errmsg_ptr, 16) };
    assert_eq!((acquired, stat), (0, 0));

    unsafe { caf_lock(token, 1, 1, ptr::null_mut(), &mut stat, errmsg_ptr, 16) };
    assert_eq!(stat, 1);
    let message: Vec<u8> = errmsg.iter().map(|&c| c as u8).collect();
    assert_eq!(&message, b"Already locked  ");

    unsafe { caf_unlock(token, 1, 1, &mut stat, ptr::null_mut(), 0) };
    assert_eq!(stat, 0);
    unsafe { caf_unlock(token, 1, 1, &mut stat, ptr::null_mut(), 0) };
    assert_eq!(stat, 1);

    deregister(&mut token);
    unsafe { caf_finalize() };
}

#[test]
fn atomics_and_events_through_the_c_interface() {
    let _session = session();
    let (token, _) = register(8, COARRAY_ALLOC, 0);
    let mut stat = -1;
    let value: u32 = 40;
    unsafe { caf_atomic_define(token, 4, 1, &value as *const u32 as *const c_void, &mut stat, 1, 4) };
    assert_eq!(stat, 0);

    let two: u32 = 2;
    let mut old: u32 = 0;
    unsafe {
        caf_atomic_op(
            1,
            token,
            4,
            1,
            &two as *const u32 as *const c_void,
            &mut old as *mut u32 as *mut c_void,
            &mut stat,
            1,
            4,
        )
    };
    assert_eq!((old, stat), (40, 0));

    let compare: u32 = 42;
    let new_val: u32 = 7;
    unsafe {
        caf_atomic_cas(
            token,
            4,
            1,
            &mut old as *mut u32 as *mut c_void,
            &compare as *const u32 as *const c_void,
            &new_val as *const u32 as *const c_void,
            &mut stat,
            1,
            4,
        )
    };
    assert_eq!(old, 42);

    let mut current: u32 = 0;
    unsafe { caf_atomic_ref(token, 4, 1, &mut current as *mut u32 as *mut c_void, &mut stat, 1, 4) };
    assert_eq!(current, 7);

    unsafe { caf_atomic_ref(token, 4, 1, &mut current as *mut u32 as *mut c_void, &mut stat, 1, 8) };
    assert_eq!(stat, 1);

    let (events, _) = register(8, EVENT_ALLOC, 0);
    unsafe {
        caf_event_post(events, 1, 1, &mut stat, ptr::null_mut(), 0);
        caf_event_post(events, 1, 1, &mut stat, ptr::null_mut(), 0);
    }
    let mut count: c_int = -1;
    unsafe { caf_event_query(events, 1, 1, &mut count, &mut stat) };
    assert_eq!(count, 2);
    unsafe { caf_event_wait(events, 1, 1, &mut stat, ptr::null_mut(), 0) };
    unsafe { caf_event_query(events, 1, 1, &mut count, &mut stat) };
    assert_eq!((count, stat), (1, 0));

    // Event storage is static and released by finalize.
    unsafe { caf_finalize() };
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
fn get_by_ref_hands_reallocated_arrays_to_the_caller() {
    let _session = session();
    let (mut token, memory) = register(size_of::<Descriptor>(), COARRAY_ALLOC, 1);
    let slot = memory as *mut Descriptor;
    let mut stat = -1;
    unsafe {
        Descriptor::array(ElementType::integer(4), 4, ptr::null_mut(), &[(1, 3)])
            .unwrap()
            .store(slot);
        caf_register_component(token, COARRAY_ALLOC, 12, 0, slot, &mut stat, ptr::null_mut(), 0, 0);
    }
    assert_eq!(stat, 0);
    let data = unsafe { Descriptor::load(slot) }.base_addr as *mut i32;
    unsafe { ptr::copy_nonoverlapping([3, 1, 4].as_ptr(), data, 3) };

    let mut array = empty_array();
    array.mode[0] = ARR_REF_FULL;
    let tail = RawReference {
        next: ptr::null(),
        version: RAW_REFERENCE_VERSION,
        ref_type: REF_ARRAY,
        item_size: 4,
        u: RawReferenceData { a: array },
    };
    let head = RawReference {
        next: &tail,
        version: RAW_REFERENCE_VERSION,
        ref_type: REF_COMPONENT,
        item_size: 4,
        u: RawReferenceData {
            c: RawComponent { offset: 0, index: 0 },
        },
    };

    let mut dst = Descriptor::unallocated(ElementType::integer(4), 4, 1);
    unsafe { caf_get_by_ref(token, 1, &mut dst, &head, 4, 4, false, true, &mut stat) };
    assert_eq!(stat, 0);
    assert!(!dst.base_addr.is_null());
    let got = unsafe { std::slice::from_raw_parts(dst.base_addr as *const i32, 3) };
    assert_eq!(got, &[3, 1, 4]);
    // Released the way compiled code releases it.
    unsafe { libc::free(dst.base_addr as *mut c_void) };

    let mut cleared = data as *mut c_void;
    unsafe { caf_deregister_component(token, 0, &mut cleared, &mut stat, ptr::null_mut(), 0) };
    assert_eq!(stat, 0);
    assert!(cleared.is_null());
    assert!(unsafe { Descriptor::load(slot) }.base_addr.is_null());

    deregister(&mut token);
    unsafe { caf_finalize() };
}

#[test]
fn failures_without_initialization_or_token_report_through_stat() {
    let _session = session();
    unsafe { caf_finalize() };
    let mut stat = -1;
    let mut errmsg = [0 as c_char; 8];
    unsafe { caf_sync_all(&mut stat, errmsg.as_mut_ptr(), 8) };
    assert_eq!(stat, 1);
    let message: Vec<u8> = errmsg.iter().map(|&c| c as u8).collect();
    assert_eq!(&message, b"Coarray ");

    unsafe { caf_init(ptr::null_mut(), ptr::null_mut()) };
    unsafe { caf_sync_images(2, [1, 1].as_ptr(), &mut stat, ptr::null_mut(), 0) };
    assert_eq!(stat, 0);
    let mut token = CafToken::null();
    unsafe { caf_deregister(&mut token, &mut stat, ptr::null_mut(), 0) };
    assert_eq!(stat, 1);
    let mut registered = CafToken::null();
    let memory = unsafe { caf_register(8, 99, &mut registered, &mut stat, ptr::null_mut(), 0, 0) };
    assert!(memory.is_null());
    assert_eq!(stat, 1);
    unsafe { caf_finalize() };
}
