//! The context-switch primitive.
//!
//! A fiber switch saves exactly the callee-saved registers of the host
//! ABI plus the stack pointer into the `from` record, restores the same
//! set from the `to` record, and returns on the target's stack. Nothing
//! else: no allocation, no locks, no flags preserved. The switch is not
//! reentrant and not signal-safe. Misuse (null target, self-switch,
//! uninitialized context) is a programming error and asserts.
//!
//! Register records are `#[repr(C)]` with the stack pointer at offset 0;
//! the per-architecture offset tables below are load-bearing — the
//! assembly reads and writes these exact offsets.
//!
//! A fresh fiber's stack is arranged so that the first switch into it
//! "returns" into a boot trampoline, which reads the entry payload out of
//! a preserved register and calls [`sovereign_fiber_entry`]; the entry
//! closure never returns (completion switches away for good).

use std::alloc::{alloc, dealloc, Layout};
use std::arch::global_asm;
use std::ptr::NonNull;

/// Saved-register record for one fiber.
///
/// x86-64 SysV layout:
///
/// | offset | field |
/// |--------|-------|
/// | 0x00   | rsp   |
/// | 0x08   | rbx   |
/// | 0x10   | rbp   |
/// | 0x18   | r12 (boot payload) |
/// | 0x20   | r13   |
/// | 0x28   | r14   |
/// | 0x30   | r15   |
#[cfg(target_arch = "x86_64")]
#[repr(C)]
pub(crate) struct Context {
    sp: *mut u8,
    rbx: u64,
    rbp: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Saved-register record for one fiber.
///
/// AAPCS64 layout: sp at 0x00, x19–x28 at 0x08..=0x50, x29 (fp) at 0x58,
/// x30 (lr) at 0x60, d8–d15 at 0x68..=0xA0. x19 carries the boot
/// payload; a fresh context's x30 points at the boot trampoline.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
pub(crate) struct Context {
    sp: *mut u8,
    x19: u64,
    x20: u64,
    x21: u64,
    x22: u64,
    x23: u64,
    x24: u64,
    x25: u64,
    x26: u64,
    x27: u64,
    x28: u64,
    fp: u64,
    lr: u64,
    d: [u64; 8],
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is implemented for x86_64 and aarch64 only");

unsafe impl Send for Context {}

impl Context {
    /// An empty record. Filled in by the first switch *out* of the
    /// running thread; switching *into* an empty record asserts.
    #[cfg(target_arch = "x86_64")]
    pub(crate) fn new() -> Self {
        Context {
            sp: std::ptr::null_mut(),
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }

    /// An empty record. Filled in by the first switch *out* of the
    /// running thread; switching *into* an empty record asserts.
    #[cfg(target_arch = "aarch64")]
    pub(crate) fn new() -> Self {
        Context {
            sp: std::ptr::null_mut(),
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
            d: [0; 8],
        }
    }

    /// Lays out a context whose first activation boots `entry` on
    /// `stack`. The entry closure must never return; it releases the CPU
    /// by switching away.
    pub(crate) fn fresh(stack: &FiberStack, entry: Box<dyn FnOnce() + Send>) -> Self {
        let payload = Box::into_raw(Box::new(entry)) as *mut u8;
        let top = stack.top();
        let mut cx = Context::new();

        #[cfg(target_arch = "x86_64")]
        unsafe {
            // The boot address sits where `ret` will pop it; the saved
            // sp is 8 mod 16, exactly the shape of a just-called frame.
            let sp = top.sub(8);
            (sp as *mut u64).write(sovereign_cx_boot as usize as u64);
            cx.sp = sp;
            cx.r12 = payload as u64;
        }

        #[cfg(target_arch = "aarch64")]
        {
            cx.sp = top;
            cx.x19 = payload as u64;
            cx.lr = sovereign_cx_boot as usize as u64;
        }

        cx
    }

    /// Whether this record has ever been activated or saved into.
    pub(crate) fn is_initialized(&self) -> bool {
        !self.sp.is_null()
    }
}

/// Suspends the current flow of control into `from` and resumes `to`.
///
/// # Safety
///
/// `from` and `to` must point to live, distinct `Context` records; `to`
/// must be initialized (a fresh fiber record or one previously saved by
/// a switch). The caller must guarantee nothing else touches either
/// record until control returns.
pub(crate) unsafe fn switch(from: *mut Context, to: *const Context) {
    assert!(!from.is_null() && !to.is_null(), "context switch on null record");
    assert!(from as *const Context != to, "context self-switch");
    assert!((*to).is_initialized(), "switch into uninitialized context");
    #[cfg(target_arch = "x86_64")]
    debug_assert_eq!((*to).sp as usize % 16, 8, "misaligned fiber stack");
    #[cfg(target_arch = "aarch64")]
    debug_assert_eq!((*to).sp as usize % 16, 0, "misaligned fiber stack");
    sovereign_cx_swap(from, to);
}

extern "C" {
    fn sovereign_cx_swap(from: *mut Context, to: *const Context);
    fn sovereign_cx_boot();
}

/// Rust landing point of the boot trampoline. Receives the leaked entry
/// closure and runs it; the closure takes responsibility for never
/// returning here.
#[no_mangle]
extern "C" fn sovereign_fiber_entry(payload: *mut u8) -> ! {
    let entry = unsafe { Box::from_raw(payload as *mut Box<dyn FnOnce() + Send>) };
    let entry = *entry;
    entry();
    unreachable!("fiber entry returned to trampoline");
}

#[cfg(target_arch = "x86_64")]
global_asm!(
    r#"
    .text
    .globl sovereign_cx_swap
    .p2align 4
sovereign_cx_swap:
    mov [rdi + 0x00], rsp
    mov [rdi + 0x08], rbx
    mov [rdi + 0x10], rbp
    mov [rdi + 0x18], r12
    mov [rdi + 0x20], r13
    mov [rdi + 0x28], r14
    mov [rdi + 0x30], r15
    mov rsp, [rsi + 0x00]
    mov rbx, [rsi + 0x08]
    mov rbp, [rsi + 0x10]
    mov r12, [rsi + 0x18]
    mov r13, [rsi + 0x20]
    mov r14, [rsi + 0x28]
    mov r15, [rsi + 0x30]
    ret

    .globl sovereign_cx_boot
    .p2align 4
sovereign_cx_boot:
    mov rdi, r12
    call sovereign_fiber_entry
    ud2
"#
);

#[cfg(target_arch = "aarch64")]
global_asm!(
    r#"
    .text
    .globl sovereign_cx_swap
    .p2align 2
sovereign_cx_swap:
    mov x9, sp
    str x9,       [x0, #0x00]
    stp x19, x20, [x0, #0x08]
    stp x21, x22, [x0, #0x18]
    stp x23, x24, [x0, #0x28]
    stp x25, x26, [x0, #0x38]
    stp x27, x28, [x0, #0x48]
    stp x29, x30, [x0, #0x58]
    stp d8,  d9,  [x0, #0x68]
    stp d10, d11, [x0, #0x78]
    stp d12, d13, [x0, #0x88]
    stp d14, d15, [x0, #0x98]
    ldr x9,       [x1, #0x00]
    mov sp, x9
    ldp x19, x20, [x1, #0x08]
    ldp x21, x22, [x1, #0x18]
    ldp x23, x24, [x1, #0x28]
    ldp x25, x26, [x1, #0x38]
    ldp x27, x28, [x1, #0x48]
    ldp x29, x30, [x1, #0x58]
    ldp d8,  d9,  [x1, #0x68]
    ldp d10, d11, [x1, #0x78]
    ldp d12, d13, [x1, #0x88]
    ldp d14, d15, [x1, #0x98]
    ret

    .globl sovereign_cx_boot
    .p2align 2
sovereign_cx_boot:
    mov x0, x19
    bl sovereign_fiber_entry
    brk #0x1
"#
);

/// A heap-allocated fiber stack, 16-byte aligned at both ends.
pub(crate) struct FiberStack {
    base: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for FiberStack {}

impl FiberStack {
    /// Allocates a stack of at least `size` bytes (rounded up to 16).
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(4096).next_multiple_of(16);
        let layout = Layout::from_size_align(size, 16).expect("fiber stack layout");
        let base = unsafe { alloc(layout) };
        let base = NonNull::new(base).expect("fiber stack allocation failed");
        FiberStack { base, layout }
    }

    /// One past the highest usable byte; stacks grow downward from here.
    pub(crate) fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.layout.size()) }
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn stack_top_is_aligned() {
        let stack = FiberStack::new(64 * 1024);
        assert_eq!(stack.top() as usize % 16, 0);
    }

    #[test]
    fn switch_cycle_preserves_the_suspended_side() {
        let stack = FiberStack::new(64 * 1024);
        let mut main_cx = Context::new();
        let mut fiber_cx = Context::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let main_addr = &mut main_cx as *mut Context as usize;
        let fiber_addr = &mut fiber_cx as *mut Context as usize;
        let fiber_hits = hits.clone();
        let entry: Box<dyn FnOnce() + Send> = Box::new(move || {
            // Locals here live on the fiber stack across both yields.
            let marker = 0xC0FFEEu64;
            fiber_hits.fetch_add(1, Ordering::SeqCst);
            unsafe { switch(fiber_addr as *mut Context, main_addr as *const Context) };
            assert_eq!(marker, 0xC0FFEE);
            fiber_hits.fetch_add(1, Ordering::SeqCst);
            unsafe { switch(fiber_addr as *mut Context, main_addr as *const Context) };
        });
        fiber_cx = Context::fresh(&stack, entry);

        unsafe { switch(main_addr as *mut Context, fiber_addr as *const Context) };
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        unsafe { switch(main_addr as *mut Context, fiber_addr as *const Context) };
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        // The fiber is parked after its second yield and never resumed.
    }

    #[test]
    fn fresh_context_is_initialized() {
        let stack = FiberStack::new(16 * 1024);
        let cx = Context::fresh(&stack, Box::new(|| {}));
        assert!(cx.is_initialized());
        assert!(!Context::new().is_initialized());
    }
}
