//! Architecture-specific stack switching.
//!
//! The switch protocol: save the callee-saved registers on the current
//! stack, publish the stack pointer through `prev_sp`, adopt `next_sp`,
//! then — already on the new stack — call the post-switch hook with the
//! previous task as argument. The hook is where the scheduler re-enqueues a
//! yielded task, commits a suspend, or tears down a terminated task; it
//! must run on the new stack so the previous one is no longer in use.
//!
//! A fresh task's stack is primed by [`stack_init`] with a frame whose
//! restore sequence "returns" into a small entry shim; the shim moves the
//! task pointer (parked in a callee-saved register) into the first argument
//! register and calls `lepton_task_entry`, which never returns.
//!
//! Full FP/SIMD register contents are caller-saved at the cooperative call
//! sites by both ABIs, so only the control state (MXCSR + x87 control word,
//! or FPCR) is carried per task.

use crate::task::Task;

/// Post-switch hook signature: receives the task that was switched away
/// from. Runs on the new task's stack.
pub(crate) type PostSwitch = unsafe extern "C" fn(*mut Task);

unsafe extern "C" {
    /// Saves callee-saved state on the current stack, stores the resulting
    /// stack pointer to `prev_sp`, switches to `next_sp`, then invokes
    /// `hook(prev)` on the new stack and resumes the new context.
    ///
    /// Returns (on the original stack) when some later switch restores it.
    pub(crate) fn lepton_stack_switch(
        prev: *mut Task,
        hook: PostSwitch,
        prev_sp: *mut usize,
        next_sp: usize,
    );
}

// lepton_stack_switch(rdi = prev task, rsi = hook, rdx = &prev->sp,
// rcx = next sp). Saved frames keep sp % 16 == 8; the extra sub/add pair
// realigns for the hook call. rdi still holds prev when the hook runs.
// lepton_task_start: a fresh-task frame parks the task pointer in r12.
#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .globl lepton_stack_switch
    .p2align 4
    lepton_stack_switch:
        push rbp
        mov  rbp, rsp
        push r15
        push r14
        push r13
        push r12
        push rbx
        mov  [rdx], rsp
        mov  rsp, rcx
        sub  rsp, 8
        call rsi
        add  rsp, 8
        pop  rbx
        pop  r12
        pop  r13
        pop  r14
        pop  r15
        pop  rbp
        ret

    .globl lepton_task_start
    .p2align 4
    lepton_task_start:
        mov  rdi, r12
        call lepton_task_entry
        ud2
    "#
);

// lepton_stack_switch(x0 = prev task, x1 = hook, x2 = &prev->sp,
// x3 = next sp). x0 still holds prev when the hook runs; x30 is restored
// from the frame after the call. lepton_task_start: a fresh-task frame
// parks the task pointer in x19.
#[cfg(target_arch = "aarch64")]
core::arch::global_asm!(
    r#"
    .text
    .globl lepton_stack_switch
    .p2align 4
    lepton_stack_switch:
        stp x29, x30, [sp, -160]!
        mov x29, sp
        stp x27, x28, [sp, 16]
        stp x25, x26, [sp, 32]
        stp x23, x24, [sp, 48]
        stp x21, x22, [sp, 64]
        stp x19, x20, [sp, 80]
        stp d8,  d9,  [sp, 96]
        stp d10, d11, [sp, 112]
        stp d12, d13, [sp, 128]
        stp d14, d15, [sp, 144]
        mov x9, sp
        str x9, [x2]
        mov sp, x3
        blr x1
        ldp d14, d15, [sp, 144]
        ldp d12, d13, [sp, 128]
        ldp d10, d11, [sp, 112]
        ldp d8,  d9,  [sp, 96]
        ldp x19, x20, [sp, 80]
        ldp x21, x22, [sp, 64]
        ldp x23, x24, [sp, 48]
        ldp x25, x26, [sp, 32]
        ldp x27, x28, [sp, 16]
        ldp x29, x30, [sp], 160
        ret

    .globl lepton_task_start
    .p2align 4
    lepton_task_start:
        mov x0, x19
        bl  lepton_task_entry
        brk #1
    "#
);

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("unsupported architecture: only x86_64 and aarch64 are supported");

/// Stack alignment required by both supported ABIs.
pub(crate) const STACK_ALIGNMENT: usize = 16;

#[cfg(target_arch = "x86_64")]
const FRAME_WORDS: usize = 7; // rbx, r12..r15, rbp, return address

#[cfg(target_arch = "aarch64")]
const FRAME_BYTES: usize = 160;

/// Builds the initial frame for a fresh task on its stack.
///
/// `top` is the (16-aligned) upper end of the usable stack; `task` is
/// delivered to the entry shim. Returns the stack pointer to store in the
/// task, in the same format a real switch-out would have produced.
///
/// # Safety
/// `top` must point just past a writable region large enough for the frame.
pub(crate) unsafe fn stack_init(top: usize, task: *mut Task) -> usize {
    debug_assert_eq!(top % STACK_ALIGNMENT, 0);

    #[cfg(target_arch = "x86_64")]
    {
        // Layout (low to high): rbx, r12, r13, r14, r15, rbp, return addr.
        let sp = top - FRAME_WORDS * 8;
        let frame = sp as *mut usize;
        // SAFETY: caller guarantees the region is writable.
        unsafe {
            for i in 0..FRAME_WORDS {
                frame.add(i).write(0);
            }
            frame.add(1).write(task as usize); // r12 carries the task
            frame.add(6).write(lepton_task_start_addr());
        }
        sp
    }

    #[cfg(target_arch = "aarch64")]
    {
        // One 160-byte frame; x19 at offset 80 carries the task, x30 at
        // offset 8 is the "return" address into the entry shim.
        let sp = top - FRAME_BYTES;
        let frame = sp as *mut usize;
        // SAFETY: caller guarantees the region is writable.
        unsafe {
            for i in 0..FRAME_BYTES / 8 {
                frame.add(i).write(0);
            }
            frame.add(10).write(task as usize);
            frame.add(1).write(lepton_task_start_addr());
        }
        sp
    }
}

fn lepton_task_start_addr() -> usize {
    unsafe extern "C" {
        fn lepton_task_start();
    }
    lepton_task_start as usize
}

/// Per-task floating-point control state.
#[derive(Clone, Copy, Default)]
pub(crate) struct FpControl {
    #[cfg(target_arch = "x86_64")]
    mxcsr: u32,
    #[cfg(target_arch = "x86_64")]
    fcw: u16,
    #[cfg(target_arch = "aarch64")]
    fpcr: u64,
}

impl FpControl {
    /// Captures the current thread's FP control state.
    pub(crate) fn save(&mut self) {
        #[cfg(target_arch = "x86_64")]
        {
            let m: *mut u32 = &mut self.mxcsr;
            let c: *mut u16 = &mut self.fcw;
            // SAFETY: stores through valid local pointers.
            unsafe {
                core::arch::asm!(
                    "stmxcsr [{m}]",
                    "fnstcw [{c}]",
                    m = in(reg) m,
                    c = in(reg) c,
                    options(nostack),
                );
            }
        }
        #[cfg(target_arch = "aarch64")]
        // SAFETY: reads a status register.
        unsafe {
            core::arch::asm!("mrs {}, fpcr", out(reg) self.fpcr, options(nomem, nostack));
        }
    }

    /// Restores a previously captured FP control state.
    pub(crate) fn restore(&self) {
        #[cfg(target_arch = "x86_64")]
        {
            let m: *const u32 = &self.mxcsr;
            let c: *const u16 = &self.fcw;
            // SAFETY: loads through valid local pointers.
            unsafe {
                core::arch::asm!(
                    "ldmxcsr [{m}]",
                    "fldcw [{c}]",
                    m = in(reg) m,
                    c = in(reg) c,
                    options(nostack),
                );
            }
        }
        #[cfg(target_arch = "aarch64")]
        // SAFETY: writes a status register.
        unsafe {
            core::arch::asm!("msr fpcr, {}", in(reg) self.fpcr, options(nomem, nostack));
        }
    }
}
