//! The scheduler: the ready bitmap, per-priority ready queues, and the
//! `current`/`next_to_run` bookkeeping (§4.2).
//!
//! Policy: strict priority, FIFO within priority. A newly runnable task of
//! equal priority to the running one does not preempt it; a priority change
//! on a runnable task moves it to the tail of its new priority's queue.
use crate::port::Port;
use crate::state::Kernel;
use crate::task::{queue_link_of, Task, TaskId, TaskState};
use crate::utils::intrusive_list::List;

/// The ready structure: one FIFO per priority level plus the bitmap that
/// tracks which of them are non-empty (§3 "Ready structure").
pub struct ReadyQueues<const NPRIO: usize> {
    pub(crate) queues: [List<TaskId>; NPRIO],
    pub(crate) bitmap: crate::utils::prio_bitmap::ReadyBitmap,
}

impl<const NPRIO: usize> ReadyQueues<NPRIO> {
    pub const fn new() -> Self {
        Self {
            queues: [List::new(); NPRIO],
            bitmap: crate::utils::prio_bitmap::ReadyBitmap::new(),
        }
    }
}

impl<
        P: Port,
        const NTASKS: usize,
        const NPRIO: usize,
        const NMUTEXES: usize,
        const NSEMS: usize,
        const NTIMERS: usize,
        const WHEEL: usize,
    > Kernel<P, NTASKS, NPRIO, NMUTEXES, NSEMS, NTIMERS, WHEEL>
{
    /// Add `RUNNABLE` to `task`'s state and enqueue it (§4.2 `mark_runnable`).
    ///
    /// Precondition: `task`'s state was zero (neither `WAIT`, `SUSPEND` nor
    /// `DORMANT`); violating this is a kernel bug, not a caller error, so it
    /// is checked with a `debug_assert`.
    pub(crate) fn mark_runnable(&mut self, task: TaskId) {
        debug_assert!(self.tasks[usize::from(task)].state.is_empty());
        let pri = self.tasks[usize::from(task)].effective_priority as usize;
        self.tasks[usize::from(task)].state |= TaskState::RUNNABLE;
        self.ready.queues[pri].push_back(&mut self.tasks[..], task, queue_link_of);
        self.ready.bitmap.set(pri);

        match self.next {
            Some(next) if (self.tasks[usize::from(next)].effective_priority as usize) <= pri => {}
            _ => self.next = Some(task),
        }
    }

    /// Remove `RUNNABLE` from `task`'s state and unlink it from its ready
    /// queue (§4.2 `clear_runnable`).
    pub(crate) fn clear_runnable(&mut self, task: TaskId) {
        let pri = self.tasks[usize::from(task)].effective_priority as usize;
        self.ready.queues[pri].unlink(&mut self.tasks[..], task, queue_link_of);
        self.tasks[usize::from(task)].state -= TaskState::RUNNABLE;

        if self.ready.queues[pri].is_empty() {
            self.ready.bitmap.clear(pri);
        }

        if self.next == Some(task) {
            self.next = self.highest_priority_ready_task();
        }
    }

    /// The head of the highest-priority non-empty ready queue. Always
    /// returns `Some` once the idle task has been created, since the idle
    /// task is always runnable (§3).
    pub(crate) fn highest_priority_ready_task(&self) -> Option<TaskId> {
        let pri = self.ready.bitmap.find_set()?;
        self.ready.queues[pri].front()
    }

    /// Move a runnable task to a new priority's ready queue tail, or just
    /// update the stored priority if it isn't runnable (§4.2 `change_priority`).
    pub(crate) fn reschedule_for_priority_change(&mut self, task: TaskId, new_priority: u8) {
        let is_runnable = self.tasks[usize::from(task)]
            .state
            .contains(TaskState::RUNNABLE);

        if is_runnable {
            let old_pri = self.tasks[usize::from(task)].effective_priority as usize;
            self.ready.queues[old_pri].unlink(&mut self.tasks[..], task, queue_link_of);
            if self.ready.queues[old_pri].is_empty() {
                self.ready.bitmap.clear(old_pri);
            }

            self.tasks[usize::from(task)].effective_priority = new_priority;

            let new_pri = new_priority as usize;
            self.ready.queues[new_pri].push_back(&mut self.tasks[..], task, queue_link_of);
            self.ready.bitmap.set(new_pri);

            self.next = self.highest_priority_ready_task();
        } else {
            self.tasks[usize::from(task)].effective_priority = new_priority;
        }
    }

    /// Request a context switch if `current != next`, unless called from ISR
    /// context, in which case the switch is deferred to the outermost ISR
    /// exit (§4.2 `yield_if_needed`, §4.9).
    pub(crate) fn yield_if_needed(&mut self) {
        if self.isr_nest_count > 0 {
            // The outermost `exit_isr` will consult `next` itself.
            return;
        }
        if self.current != self.next {
            self.dispatch();
        }
    }

    #[allow(dead_code)]
    pub(crate) fn task_ref(&self, id: TaskId) -> &Task<P> {
        &self.tasks[usize::from(id)]
    }

    pub(crate) fn task_mut(&mut self, id: TaskId) -> &mut Task<P> {
        &mut self.tasks[usize::from(id)]
    }

    pub(crate) fn ready_bit_set(&self, pri: usize) -> bool {
        self.ready.bitmap.get(pri)
    }

    pub(crate) fn ready_queue_is_empty(&self, pri: usize) -> bool {
        self.ready.queues[pri].is_empty()
    }
}
