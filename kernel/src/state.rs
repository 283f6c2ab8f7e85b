//! The kernel record itself: the fixed-size arenas every other module
//! indexes into, construction, the dispatcher, and the handful of
//! system-wide services that don't belong to any one primitive (§2.8, §6
//! "System services").
//!
//! Rather than the teacher's `KernelTraits`-indirected `'static` singleton
//! (a zero-sized type whose associated functions reach a `static` through a
//! trait), this is a single explicitly-constructed record the application
//! owns and threads through by `&mut` — the alternative spec §9 itself
//! names ("a single explicitly-constructed kernel record ... addressed by
//! small integer indices").
use crate::mutex::Mutex;
use crate::port::{ContextKind, Port};
use crate::semaphore::Semaphore;
use crate::sched::ReadyQueues;
use crate::task::{Task, TaskId};
use crate::time::Tick;
use crate::timer::{Timer, TimerId, Wheel};
use crate::utils::intrusive_list::List;

/// The kernel's entire mutable state, generic over the architecture port
/// and sized entirely at compile time by its const generic parameters —
/// no heap allocation anywhere in this crate (§1 Non-goals).
///
/// - `NTASKS`: maximum number of tasks, including the idle task.
/// - `NPRIORITIES`: number of distinct priority levels (0 = highest).
/// - `NMUTEXES`, `NSEMS`, `NTIMERS`: maximum live objects of each kind.
/// - `WHEEL`: tick-wheel size, a power of two (§4.8).
pub struct Kernel<
    P: Port,
    const NTASKS: usize,
    const NPRIORITIES: usize,
    const NMUTEXES: usize,
    const NSEMS: usize,
    const NTIMERS: usize,
    const WHEEL: usize,
> {
    pub(crate) tasks: [Task<P>; NTASKS],
    pub(crate) all_tasks: List<TaskId>,
    pub(crate) ready: ReadyQueues<NPRIORITIES>,
    pub(crate) current: Option<TaskId>,
    pub(crate) next: Option<TaskId>,

    pub(crate) mutexes: [Mutex; NMUTEXES],
    pub(crate) semaphores: [Semaphore; NSEMS],
    pub(crate) timers: [Timer; NTIMERS],

    pub(crate) now: Tick,
    pub(crate) timer_wheel: Wheel<TimerId, WHEEL>,
    pub(crate) task_timeout_wheel: Wheel<TaskId, WHEEL>,

    pub(crate) isr_nest_count: u32,
    pub(crate) id_tag_counter: u32,
    /// Set the instant the kernel performs its one real transfer of control
    /// in [`Self::start`], not when `start` is first called. Gates
    /// [`Self::dispatch`] — `user_init` may create and activate tasks of any
    /// priority, including above the idle task, without triggering a real
    /// `Port::context_switch` before the kernel has actually booted — and
    /// doubles as the re-entrant-`start` guard (§9, TNeo's `tn_sys_state &
    /// RUNNING` check serves both the same roles).
    started: bool,

    #[cfg_attr(not(feature = "deadlock_detection"), allow(dead_code))]
    pub(crate) deadlock_active: bool,
    #[cfg_attr(not(feature = "deadlock_detection"), allow(dead_code))]
    pub(crate) deadlock_participants: [bool; NTASKS],
    #[cfg_attr(not(feature = "deadlock_detection"), allow(dead_code))]
    pub(crate) deadlock_callback: Option<fn(bool)>,
}

impl<
        P: Port,
        const NTASKS: usize,
        const NPRIORITIES: usize,
        const NMUTEXES: usize,
        const NSEMS: usize,
        const NTIMERS: usize,
        const WHEEL: usize,
    > Kernel<P, NTASKS, NPRIORITIES, NMUTEXES, NSEMS, NTIMERS, WHEEL>
{
    /// Build an empty kernel record: no tasks, mutexes, semaphores or
    /// timers exist yet, and the tick counter starts at zero.
    ///
    /// `WHEEL` must be a power of two (§4.8); violating this is a
    /// configuration error caught the first time a timer is armed, via a
    /// `debug_assert` in the modulo arithmetic's call sites rather than
    /// here, since a non-`const fn` check would rule out `const` kernel
    /// instances.
    pub const fn new() -> Self {
        Self {
            tasks: [const { Task::unused() }; NTASKS],
            all_tasks: List::new(),
            ready: ReadyQueues::new(),
            current: None,
            next: None,
            mutexes: [const { Mutex::unused() }; NMUTEXES],
            semaphores: [const { Semaphore::unused() }; NSEMS],
            timers: [const { Timer::unused() }; NTIMERS],
            now: Tick::ZERO,
            timer_wheel: Wheel::new(),
            task_timeout_wheel: Wheel::new(),
            isr_nest_count: 0,
            id_tag_counter: 0,
            started: false,
            deadlock_active: false,
            deadlock_participants: [false; NTASKS],
            deadlock_callback: None,
        }
    }

    /// Install the callback the deadlock detector invokes when a cycle
    /// becomes active and again when it clears (§4.7).
    #[cfg(feature = "deadlock_detection")]
    pub fn set_deadlock_callback(&mut self, callback: fn(bool)) {
        self.deadlock_callback = Some(callback);
    }

    /// `context_get` (§6): which execution domain the caller is in.
    pub fn context(&self) -> ContextKind {
        if self.isr_nest_count > 0 {
            ContextKind::Isr
        } else if self.current.is_some() {
            ContextKind::Task
        } else {
            ContextKind::None
        }
    }

    /// `sys_time_get` (§6): the current tick count.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// `sys_start` (§6): create and activate the idle task, run
    /// `user_init` once (passed `self`, since this kernel is an owned
    /// record rather than a global singleton) to let the application create
    /// and activate its own tasks, then transfer control to the
    /// highest-priority runnable task and never return.
    ///
    /// # Safety
    ///
    /// `idle_stack` must outlive the kernel and not alias any other task's
    /// stack, per [`Self::create_task`].
    pub unsafe fn start(&mut self, idle_stack: &'static mut [u8], user_init: fn(&mut Self)) -> ! {
        assert!(!self.started, "Kernel::start called twice");

        let idle_priority = (NPRIORITIES - 1) as u8;
        let idle = unsafe { self.create_task(idle_priority, idle_stack, idle_entry, 0) }
            .expect("failed to create the idle task");
        self.activate_task(idle).expect("failed to activate the idle task");

        // Every `create_task`/`activate_task` call above and inside
        // `user_init` runs with `started == false`, so `dispatch` is a
        // no-op throughout: `next` tracks the highest-priority runnable
        // task via `mark_runnable`/`reschedule_for_priority_change`
        // regardless, but no `Port::context_switch` happens until the one
        // below, even if `user_init` activates a task above idle's priority.
        user_init(self);

        let first = self
            .next
            .expect("no runnable task after user_init (is the idle task missing?)");
        self.current = Some(first);
        self.started = true;
        let ctx = self.tasks[usize::from(first)]
            .stack_context
            .as_ref()
            .expect("the first task to run was never activated");
        P::context_switch_now_nosave(ctx)
    }

    /// `sys_tick_int_processing` (§6): drive the timer wheel by one tick.
    /// Must be called from the periodic tick ISR, inside
    /// `enter_isr`/`exit_isr` (§4.9).
    pub fn tick(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        self.advance_tick();
    }

    /// Switch to `self.next` if it differs from `self.current`. Never
    /// called while `isr_nest_count > 0` (§4.9) — `yield_if_needed` is
    /// responsible for that check.
    ///
    /// A no-op until [`Self::start`] performs the kernel's first real
    /// transfer of control — `user_init` is free to activate tasks of any
    /// priority without this triggering a premature `Port::context_switch`
    /// on a stack that hasn't booted yet.
    pub(crate) fn dispatch(&mut self) {
        if !self.started {
            return;
        }
        let Some(next) = self.next else {
            return;
        };
        if self.current == Some(next) {
            return;
        }
        match self.current {
            Some(from) => {
                self.current = Some(next);
                let (from_ctx, to_ctx) = self.stack_contexts_mut(from, next);
                P::context_switch(Some(from_ctx), to_ctx);
            }
            None => {
                // The kernel hasn't performed its first switch yet; record
                // the choice and leave the actual (non-returning) transfer
                // to `Kernel::start`.
                self.current = Some(next);
            }
        }
    }

    /// Borrow `a`'s and `b`'s stack contexts simultaneously. `a != b` is
    /// the caller's responsibility (true of every `dispatch` call site,
    /// since `current != next` is checked first).
    fn stack_contexts_mut(&mut self, a: TaskId, b: TaskId) -> (&mut P::StackContext, &P::StackContext) {
        let (ai, bi) = (usize::from(a), usize::from(b));
        debug_assert_ne!(ai, bi);
        if ai < bi {
            let (left, right) = self.tasks.split_at_mut(bi);
            (
                left[ai].stack_context.as_mut().expect("task has no saved context"),
                right[0].stack_context.as_ref().expect("task has no saved context"),
            )
        } else {
            let (left, right) = self.tasks.split_at_mut(ai);
            (
                right[0].stack_context.as_mut().expect("task has no saved context"),
                left[bi].stack_context.as_ref().expect("task has no saved context"),
            )
        }
    }
}

fn idle_entry(_arg: usize) {
    loop {
        core::hint::spin_loop();
    }
}

/// A scope guard that disables interrupts on construction and restores the
/// prior mask on drop — the kernel's sole mutual-exclusion mechanism (§5).
/// Every public service that touches ready queues, wait queues, task state,
/// timer lists or object ownership opens one of these as its first
/// statement, the same way `critical_section::CriticalSection` or
/// `cortex_m::interrupt::free` scope a critical section in other embedded
/// crates built on a disable/restore pair.
///
/// Safe to nest: [`Port::disable_interrupts`] returns the *previous* mask
/// rather than a fixed "enabled" token, so an inner guard's drop is a no-op
/// and only the outermost one actually re-enables interrupts — the same
/// property that makes raw `PRIMASK`/`mstatus.MIE` save-restore nest
/// correctly on real hardware.
pub(crate) struct CriticalSection<P: Port>(P::Mask);

impl<P: Port> CriticalSection<P> {
    pub(crate) fn enter() -> Self {
        Self(P::disable_interrupts())
    }
}

impl<P: Port> Drop for CriticalSection<P> {
    fn drop(&mut self) {
        P::restore_interrupts(self.0);
    }
}
