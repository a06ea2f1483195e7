//! Function-table hooks over fake COM-style objects

use framelink::core::signatures::SWAP_CHAIN_PRESENT_INDEX;
use framelink::core::{PresentationHook, VTableHookEngine};
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Object whose first word points at its own boxed table
struct FakeObject {
    table: Box<[usize]>,
    object: Box<usize>,
}

impl FakeObject {
    fn new(slots: usize, fill: usize) -> Self {
        let table = vec![fill; slots].into_boxed_slice();
        let object = Box::new(table.as_ptr() as usize);
        Self { table, object }
    }

    fn ptr(&mut self) -> *mut c_void {
        &mut *self.object as *mut usize as *mut c_void
    }

    fn table_addr(&self) -> usize {
        self.table.as_ptr() as usize
    }

    fn slot(&self, index: usize) -> usize {
        // Read through a volatile load; the hook engine writes behind our back
        unsafe { std::ptr::read_volatile(self.table.as_ptr().add(index)) }
    }
}

#[test]
fn test_install_then_remove_restores_bits() {
    let engine = VTableHookEngine::new();
    let mut object = FakeObject::new(16, 0x1111_0000);
    let table = unsafe { VTableHookEngine::get_table(object.ptr()) }.unwrap();
    assert_eq!(table, object.table_addr());

    let record = unsafe { engine.install(table, 5, 0xAAAA) }.unwrap();
    assert_eq!(record.original, 0x1111_0000);
    assert_eq!(object.slot(5), 0xAAAA);

    // A repeat install keeps the first original
    let again = unsafe { engine.install(table, 5, 0xBBBB) }.unwrap();
    assert_eq!(again.original, 0x1111_0000);
    assert_eq!(object.slot(5), 0xAAAA);

    unsafe { engine.remove(table, 5) }.unwrap();
    assert_eq!(object.slot(5), 0x1111_0000);
    assert!(!engine.is_hooked(table, 5));
}

#[test]
fn test_null_object_has_no_table() {
    assert!(unsafe { VTableHookEngine::get_table(std::ptr::null()) }.is_none());
}

static FORWARDED: AtomicUsize = AtomicUsize::new(0);

unsafe extern "system" fn original_present(_this: *mut c_void, sync: u32, _flags: u32) -> i32 {
    FORWARDED.fetch_add(1, Ordering::SeqCst);
    sync as i32
}

#[test]
fn test_present_hook_dispatches_and_forwards() {
    let engine = Arc::new(VTableHookEngine::new());
    let mut object = FakeObject::new(18, 0);
    let original = original_present as usize;
    object.table[SWAP_CHAIN_PRESENT_INDEX] = original;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let mut hook = PresentationHook::new(engine).with_callback(Arc::new(move |swap_chain: *mut c_void| {
        counter.store(swap_chain as usize, Ordering::SeqCst);
    }));

    unsafe { hook.install(object.ptr()) }.unwrap();
    assert!(hook.is_installed());
    assert_eq!(hook.hooked_table(), Some(object.table_addr()));

    let patched = object.slot(SWAP_CHAIN_PRESENT_INDEX);
    assert_ne!(patched, original);
    let present: unsafe extern "system" fn(*mut c_void, u32, u32) -> i32 =
        unsafe { std::mem::transmute(patched) };
    let result = unsafe { present(object.ptr(), 3, 0) };

    assert_eq!(result, 3);
    assert_eq!(FORWARDED.load(Ordering::SeqCst), 1);
    assert_eq!(seen.load(Ordering::SeqCst), object.ptr() as usize);

    hook.remove().unwrap();
    assert_eq!(object.slot(SWAP_CHAIN_PRESENT_INDEX), original);
}
