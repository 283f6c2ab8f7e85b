//! The architecture port interface (§2.9, §6 "Architecture port").
//!
//! Everything in this module is an opaque contract the kernel calls into;
//! the per-architecture context switch, stack frame layout and interrupt
//! masking are explicitly out of scope for this crate (§1) and live in a
//! separate port crate, the way `r3_port_arm_m`/`r3_port_riscv` sit beside
//! `r3_kernel` in the teacher workspace. [`crate::state::Kernel`] is generic
//! over this trait and never assumes a concrete architecture.
use core::fmt::Debug;

/// Opaque saved interrupt-mask state, returned by
/// [`Port::disable_interrupts`] and handed back to [`Port::restore_interrupts`].
///
/// Implementations typically wrap the raw value of a status register (e.g.
/// `PRIMASK` on Armv7-M, `mstatus.MIE` on RISC-V).
pub trait InterruptMask: Copy + Debug + 'static {}
impl<T: Copy + Debug + 'static> InterruptMask for T {}

/// The execution context a kernel service is called from (§6 `context_get`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Running as a kernel task.
    Task,
    /// Running inside an interrupt service routine.
    Isr,
    /// The kernel has not started yet ([`crate::state::Kernel::start`] was
    /// not called, or this thread has no notion of kernel context).
    None,
}

/// The per-architecture collaborator every [`crate::state::Kernel`] method
/// eventually calls into.
///
/// All state mutation performed by the kernel itself happens through plain
/// `&mut Kernel` method calls (see [`crate::state::Kernel`]); `Port` is
/// reserved for the things that are inherently architecture-specific and
/// cannot be expressed in portable Rust: masking interrupts, switching
/// stacks, and laying out a brand-new task's initial stack frame.
pub trait Port {
    /// The saved interrupt-mask type for [`Self::disable_interrupts`].
    type Mask: InterruptMask;

    /// An opaque, architecture-specific representation of a task's saved
    /// execution context (typically just the saved stack pointer).
    type StackContext: Copy + Debug + 'static;

    /// Disable interrupts globally and return a token that restores the
    /// previous mask state when passed to [`Self::restore_interrupts`].
    ///
    /// This is the kernel's sole mutual-exclusion mechanism (§5): every
    /// operation that touches ready queues, wait queues, task state, timer
    /// lists, or mutex ownership runs with interrupts disabled.
    fn disable_interrupts() -> Self::Mask;

    /// Restore a previously saved interrupt mask.
    fn restore_interrupts(mask: Self::Mask);

    /// Report whether the caller is currently executing inside an ISR.
    ///
    /// Used as a fallback/consistency check; the kernel's own ISR-nesting
    /// counter (§4.9) is authoritative whenever `sys_tick_int_processing`
    /// and friends are used consistently.
    fn is_in_isr() -> bool;

    /// Initialize a fresh stack for a newly activated task, so that the
    /// first context switch into it calls `entry(arg)` on a stack of size
    /// `stack_size` bytes, topped at `stack_top`.
    ///
    /// # Safety
    ///
    /// `stack_top` must point one-past-the-end of a valid, writable,
    /// `stack_size`-byte region that outlives the task.
    unsafe fn initialize_stack(
        stack_top: *mut u8,
        stack_size: usize,
        entry: fn(usize),
        arg: usize,
    ) -> Self::StackContext;

    /// Perform a full context switch from `from` (the currently running
    /// task's saved-context slot, or `None` if no task was running yet) to
    /// `to`.
    ///
    /// Only called from task context with `next_to_run` scheduling state
    /// already committed; never called while `nest_count > 0` (§4.9,
    /// §9 "Deferred context switch from ISRs").
    fn context_switch(from: Option<&mut Self::StackContext>, to: &Self::StackContext);

    /// Switch to `to` without saving the currently running context.
    ///
    /// Used once, by [`crate::state::Kernel::start`], to dispatch the first
    /// task: there is no prior context worth preserving.
    fn context_switch_now_nosave(to: &Self::StackContext) -> !;
}
