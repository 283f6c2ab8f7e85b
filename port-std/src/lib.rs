//! A hosted-environment architecture port: one OS thread per task, a
//! `park`/`unpark` token as the context-switch primitive, and a global spin
//! lock standing in for hardware interrupt masking.
//!
//! A more elaborate hosted port could drive a user-mode-scheduling thread
//! group to multiplex several interrupt priority levels onto a handful of
//! worker threads. This kernel's `Port` contract is simpler — one
//! synchronous, blocking `context_switch` call, no interrupt priority
//! levels — so this port skips that machinery and maps each task directly
//! onto its own `std::thread`, using the plain `std::thread::park`/
//! `Thread::unpark` pair: `unpark` delivers a token that a later `park`
//! consumes even if it arrives first, which is exactly the handoff a
//! cooperative one-task-running-at-a-time scheduler needs.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::Thread;

use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use rkos_kernel::port::Port;
use rkos_kernel::TimerHandle;
use spin::Mutex as SpinMutex;

/// One slot per spawned task thread, addressed by index so that
/// [`StackContext`] stays `Copy` (a real [`Thread`] handle is `Clone` but
/// not `Copy`).
struct ThreadSlot {
    thread: Thread,
    /// Consumed by whichever `park` loop iteration observes it `true`;
    /// guards against `std::thread::park`'s documented spurious wakeups.
    turn: AtomicBool,
}

static REGISTRY: Lazy<Mutex<Vec<ThreadSlot>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// The kernel's sole mutual-exclusion primitive on this port. Real
/// interrupt masking has no OS equivalent; a global lock serializes the
/// currently-running task thread against whichever thread is simulating an
/// interrupt (see [`with_interrupt`]).
static CPU_LOCK: SpinMutex<()> = SpinMutex::new(());

thread_local! {
    static CURRENT_SLOT: std::cell::Cell<Option<u32>> = const { std::cell::Cell::new(None) };
}

/// An index into [`REGISTRY`]. `Copy`, `Debug`, `'static` as required by
/// [`Port::StackContext`]; the kernel never inspects it beyond equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackContext(u32);

fn park_until_woken(slot: u32) {
    loop {
        let consumed = {
            let reg = REGISTRY.lock().unwrap();
            reg[slot as usize].turn.swap(false, Ordering::AcqRel)
        };
        if consumed {
            return;
        }
        std::thread::park();
    }
}

fn wake(slot: u32) {
    trace!("task transition: waking slot {slot}");
    let reg = REGISTRY.lock().unwrap();
    reg[slot as usize].turn.store(true, Ordering::Release);
    reg[slot as usize].thread.unpark();
}

/// A `deadlock_callback` (see [`rkos_kernel::state::Kernel::set_deadlock_callback`])
/// that logs at `warn` when a cycle becomes active and at `debug` when it
/// clears — the escalating-vs-routine split a hosted port's event log needs,
/// since only one of the two states represents an application bug.
pub fn log_deadlock(active: bool) {
    if active {
        warn!("deadlock detected among mutex waiters");
    } else {
        debug!("deadlock condition cleared");
    }
}

/// A software-timer callback (see [`rkos_kernel::state::Kernel::create_timer`])
/// that logs each fire at `debug`. Pass this directly when a timer's only
/// purpose is observability; combine it with the application's own callback
/// otherwise.
pub fn log_timer_fire(handle: TimerHandle, user_data: usize) {
    debug!("timer fired: {handle:?} user_data={user_data}");
}

/// Run `f` as a simulated interrupt service routine: takes the same global
/// lock a running task implicitly holds (by virtue of never yielding the
/// CPU except through [`StdPort::context_switch`]), so `f` observes kernel
/// state consistently with whatever task it preempted.
///
/// Call this from a dedicated OS thread (e.g. a periodic ticker) rather
/// than from a task thread — nesting it under an already-held lock from the
/// same thread would deadlock, since [`spin::mutex::SpinMutex`] isn't
/// reentrant.
///
/// A [`spin::Mutex`] rather than [`std::sync::Mutex`] for this role:
/// contention here is always sub-microsecond (the whole point of a kernel
/// critical section is to be short), so the spin/no-syscall tradeoff favors
/// `spin` over blocking the OS scheduler.
pub fn with_interrupt<R>(f: impl FnOnce() -> R) -> R {
    let _guard = CPU_LOCK.lock();
    f()
}

/// The architecture port itself. Zero-sized: all its state lives in the
/// process-wide statics above, the same way a bare-metal port's state lives
/// in fixed hardware registers rather than in a value the kernel passes
/// around.
pub struct StdPort;

impl Port for StdPort {
    type Mask = ();
    type StackContext = StackContext;

    fn disable_interrupts() -> Self::Mask {
        // Safety: paired with an unconditional `force_unlock` in
        // `restore_interrupts`. `CriticalSection` (the kernel's own guard
        // type) guarantees every `disable` is followed by exactly one
        // `restore`, in LIFO order, the same discipline real PRIMASK-style
        // save/restore relies on.
        core::mem::forget(CPU_LOCK.lock());
    }

    fn restore_interrupts(_mask: Self::Mask) {
        // Safety: see `disable_interrupts`.
        unsafe { CPU_LOCK.force_unlock() };
    }

    fn is_in_isr() -> bool {
        CURRENT_SLOT.with(|c| c.get().is_none())
    }

    unsafe fn initialize_stack(
        _stack_top: *mut u8,
        stack_size: usize,
        entry: fn(usize),
        arg: usize,
    ) -> Self::StackContext {
        let slot = {
            let mut reg = REGISTRY.lock().unwrap();
            reg.push(ThreadSlot {
                // Placeholder; replaced once the spawned thread reports its
                // own `Thread` handle below. `std::thread::current()` isn't
                // available until the thread body runs.
                thread: std::thread::current(),
                turn: AtomicBool::new(false),
            });
            (reg.len() - 1) as u32
        };

        // `wake(slot)` may be called (via `context_switch`) as soon as this
        // function returns, so the real `Thread` handle must be installed
        // in `REGISTRY` — replacing the caller-thread placeholder pushed
        // above — before that can happen. The new thread reports readiness
        // over `ready_tx` once it has done so.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
        let builder = std::thread::Builder::new().stack_size(stack_size.max(16 * 1024));
        let handle = builder
            .spawn(move || {
                {
                    let mut reg = REGISTRY.lock().unwrap();
                    reg[slot as usize].thread = std::thread::current();
                }
                let _ = ready_tx.send(());
                CURRENT_SLOT.with(|c| c.set(Some(slot)));
                park_until_woken(slot);
                entry(arg);
                // A task entry function isn't expected to return in this
                // kernel's model (it should call `terminate_task` on
                // itself); if it does, park forever rather than let the OS
                // thread exit out from under a live task slot.
                loop {
                    std::thread::park();
                }
            })
            .expect("failed to spawn a task thread");
        drop(handle);
        ready_rx.recv().expect("task thread failed to start");

        trace!("task transition: spawned thread for slot {slot}");
        StackContext(slot)
    }

    fn context_switch(from: Option<&mut Self::StackContext>, to: &Self::StackContext) {
        wake(to.0);
        if from.is_some() {
            let my_slot = CURRENT_SLOT
                .with(|c| c.get())
                .expect("context_switch with `from` called from a non-task thread");
            trace!("task transition: slot {my_slot} parking for slot {}", to.0);
            park_until_woken(my_slot);
        }
    }

    fn context_switch_now_nosave(to: &Self::StackContext) -> ! {
        wake(to.0);
        loop {
            std::thread::park();
        }
    }
}

