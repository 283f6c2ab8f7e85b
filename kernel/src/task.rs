//! Tasks: the task control block, its state bitfield, and the lifecycle
//! services that create, activate, suspend, and retire a task (§3, §6).
use bitflags::bitflags;

use crate::error::{Error, Result, WaitResult};
use crate::port::Port;
use crate::state::{CriticalSection, Kernel};
use crate::time::Timeout;
use crate::utils::intrusive_list::ListLink;
use crate::wait::WaitReason;

/// An index into [`Kernel`]'s task array.
///
/// Internal to the crate: callers hold a [`TaskHandle`], which additionally
/// carries the identity tag that guards against stale handles (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u16);

impl From<TaskId> for usize {
    fn from(id: TaskId) -> usize {
        id.0 as usize
    }
}

impl From<usize> for TaskId {
    fn from(i: usize) -> TaskId {
        TaskId(i as u16)
    }
}

/// Field accessor for the ready/wait queue link, passed to [`crate::utils::intrusive_list::List`]
/// methods operating on [`crate::sched::ReadyQueues`] or a wait queue.
pub(crate) fn queue_link_of<P: Port>(t: &mut Task<P>) -> &mut ListLink<TaskId> {
    &mut t.queue_link
}
pub(crate) fn queue_link_ref<P: Port>(t: &Task<P>) -> &ListLink<TaskId> {
    &t.queue_link
}

/// Field accessor for the all-tasks registry link.
pub(crate) fn registry_link_of<P: Port>(t: &mut Task<P>) -> &mut ListLink<TaskId> {
    &mut t.registry_link
}

/// Field accessor for the task's own timeout slot, passed to
/// [`crate::timer::Wheel`] methods operating on [`Kernel::task_timeout_wheel`].
pub(crate) fn timeout_node_of<P: Port>(t: &mut Task<P>) -> &mut crate::timer::TimerNode<TaskId> {
    &mut t.timeout
}

/// An opaque, user-facing reference to a task, returned by
/// [`Kernel::create_task`].
///
/// Carries the task slot's identity tag (§7): presenting a handle from a
/// task that has since been deleted and whose slot was recycled yields
/// [`Error::InvalidObject`] rather than silently operating on the wrong
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
    pub(crate) tag: u32,
}

bitflags! {
    /// The task state bitfield (§3).
    ///
    /// Multiple bits may be set simultaneously — `SUSPEND` is orthogonal and
    /// may coexist with `WAIT` — but a task is eligible to execute only when
    /// the state equals `RUNNABLE` alone.
    #[derive(Default)]
    pub struct TaskState: u8 {
        const RUNNABLE = 0b0001;
        const WAIT     = 0b0010;
        const SUSPEND  = 0b0100;
        const DORMANT  = 0b1000;
    }
}

/// The task control block (§3 "Task").
pub struct Task<P: Port> {
    /// Whether this slot currently names a created task. `false` means the
    /// slot is free for [`Kernel::create_task`] to reuse.
    pub(crate) exists: bool,
    /// Bumped every time this slot transitions `exists: false -> true`;
    /// stored in the [`TaskHandle`] returned by `create_task` (§7).
    pub(crate) id_tag: u32,

    pub(crate) state: TaskState,
    pub(crate) base_priority: u8,
    pub(crate) effective_priority: u8,

    /// Membership in exactly one of: a ready queue, a wait queue. Valid
    /// only while `exists` (§3 invariant).
    pub(crate) queue_link: ListLink<TaskId>,
    /// Membership in the all-tasks registry, valid for the lifetime of the
    /// created task.
    pub(crate) registry_link: ListLink<TaskId>,
    /// The mutexes this task currently holds (§3 "list of mutexes this
    /// task currently owns"), used both to recompute its effective
    /// priority on unlock and by the deadlock detector's boost walk.
    pub(crate) owned_mutexes: crate::utils::intrusive_list::List<crate::mutex::MutexId>,

    /// What (if anything) this task is currently waiting for; doubles as
    /// the "wait-reason tag" of §3 and the mechanism by which a generic
    /// wait-interruption routine finds the right wait queue to unlink from.
    pub(crate) wait_reason: WaitReason,
    pub(crate) wait_result: WaitResult,
    /// The task's timer slot for timed waits (§3), armed by
    /// [`Kernel::arm_task_timeout`] and disarmed by
    /// [`Kernel::cancel_task_timeout`].
    pub(crate) timeout: crate::timer::TimerNode<TaskId>,

    /// One-past-the-end of the task's stack region and its size in bytes,
    /// supplied by the caller of `create_task`. The pointer is only ever
    /// dereferenced by `P::initialize_stack`, which is `unsafe` and whose
    /// safety obligations are satisfied at `create_task`'s own `unsafe`
    /// boundary.
    pub(crate) stack_top: *mut u8,
    pub(crate) stack_size: usize,
    pub(crate) stack_context: Option<P::StackContext>,
    pub(crate) entry: fn(usize),
    pub(crate) entry_arg: usize,
}

// Safety: a `Task` is only ever accessed through `&mut Kernel`, which is
// itself required (by the port contract) to live behind the same
// interrupt-disable discipline that guards access from ISR context. The raw
// stack pointer is never read except by `P::initialize_stack`.
unsafe impl<P: Port> Send for Task<P> {}
unsafe impl<P: Port> Sync for Task<P> {}

impl<P: Port> Task<P> {
    pub(crate) const fn unused() -> Self {
        Self {
            exists: false,
            id_tag: 0,
            state: TaskState::DORMANT,
            base_priority: 0,
            effective_priority: 0,
            queue_link: ListLink::new(),
            registry_link: ListLink::new(),
            owned_mutexes: crate::utils::intrusive_list::List::new(),
            wait_reason: WaitReason::None,
            wait_result: WaitResult::Ok,
            timeout: crate::timer::TimerNode::unused(),
            stack_top: core::ptr::null_mut(),
            stack_size: 0,
            stack_context: None,
            entry: |_| {},
            entry_arg: 0,
        }
    }

    /// Whether `self` is eligible to execute: `state == RUNNABLE` exactly
    /// (§3 invariant).
    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::RUNNABLE
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
    fn validate(&self, handle: TaskHandle) -> Result<TaskId> {
        let task = &self.tasks[usize::from(handle.id)];
        if cfg!(feature = "object_ids") && (!task.exists || task.id_tag != handle.tag) {
            Err(Error::InvalidObject)
        } else {
            Ok(handle.id)
        }
    }

    /// Create a new task in the Dormant state (§6 `create`).
    ///
    /// # Safety
    ///
    /// `stack` must be a region that outlives the created task and is not
    /// aliased by any other task's stack.
    pub unsafe fn create_task(
        &mut self,
        priority: u8,
        stack: &'static mut [u8],
        entry: fn(usize),
        entry_arg: usize,
    ) -> Result<TaskHandle> {
        let _cs = CriticalSection::<P>::enter();
        if priority as usize >= NPRIO {
            return Err(Error::WrongParameter);
        }
        let slot = (0..NTASKS)
            .find(|&i| !self.tasks[i].exists)
            .ok_or(Error::Overflow)?;

        let id_tag = self.next_id_tag();
        let id = crate::task::TaskId(slot as u16);
        let stack_size = stack.len();
        let stack_top = stack.as_mut_ptr_range().end;

        self.tasks[slot] = Task {
            exists: true,
            id_tag,
            state: TaskState::DORMANT,
            base_priority: priority,
            effective_priority: priority,
            queue_link: ListLink::new(),
            registry_link: ListLink::new(),
            owned_mutexes: crate::utils::intrusive_list::List::new(),
            wait_reason: WaitReason::None,
            wait_result: WaitResult::Ok,
            timeout: crate::timer::TimerNode::unused(),
            stack_top,
            stack_size,
            stack_context: None,
            entry,
            entry_arg,
        };
        self.all_tasks
            .push_back(&mut self.tasks[..], id, registry_link_of);

        Ok(TaskHandle { id, tag: id_tag })
    }

    /// Transition a Dormant task to Runnable, initializing its stack (§6
    /// `activate`).
    pub fn activate_task(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &self.tasks[usize::from(id)];
        if task.state != TaskState::DORMANT {
            return Err(Error::IllegalUse);
        }

        let stack_context = unsafe {
            P::initialize_stack(task.stack_top, task.stack_size, task.entry, task.entry_arg)
        };

        let task = &mut self.tasks[usize::from(id)];
        task.stack_context = Some(stack_context);
        task.state = TaskState::empty();
        self.mark_runnable(id);
        self.yield_if_needed();
        Ok(())
    }

    /// Block the currently running task for `ticks` (§6 `sleep`).
    ///
    /// Must be called from task context; see [`crate::error::Error::InterruptContext`].
    pub fn sleep(&mut self, ticks: u32) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.current.ok_or(Error::InterruptContext)?;
        if ticks == 0 {
            return Ok(());
        }
        self.block_current(WaitReason::Sleep, Timeout::Ticks(ticks))
            .into_result()
    }

    /// Wake a task that is sleeping (§6 `wakeup`). Returns
    /// [`Error::IllegalUse`] if the task is not currently asleep.
    pub fn wakeup_task(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &self.tasks[usize::from(id)];
        if task.state != TaskState::WAIT || task.wait_reason != WaitReason::Sleep {
            return Err(Error::IllegalUse);
        }
        self.complete_wait(id, WaitResult::Ok);
        self.yield_if_needed();
        Ok(())
    }

    /// Force any ongoing wait on `handle` to return `FORCED` (§6 `release_wait`,
    /// §5 Cancellation).
    pub fn release_wait(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &self.tasks[usize::from(id)];
        if task.state != TaskState::WAIT {
            return Err(Error::IllegalUse);
        }
        self.complete_wait(id, WaitResult::Forced);
        self.yield_if_needed();
        Ok(())
    }

    /// Set the `SUSPEND` bit (§6 `suspend`). Orthogonal to `WAIT`: a task
    /// can be suspended while waiting, in which case it only becomes
    /// runnable again once both `resume`d and its wait completes.
    pub fn suspend_task(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &mut self.tasks[usize::from(id)];
        if task.state.contains(TaskState::DORMANT) || task.state.contains(TaskState::SUSPEND) {
            return Err(Error::IllegalUse);
        }
        let was_runnable = task.state.contains(TaskState::RUNNABLE);
        task.state |= TaskState::SUSPEND;
        if was_runnable {
            self.clear_runnable(id);
        }
        self.yield_if_needed();
        Ok(())
    }

    /// Clear the `SUSPEND` bit (§6 `resume`). If the task has no other
    /// reason to stay blocked, it becomes runnable again; per §8's
    /// round-trip property this is observable only as a tail-repositioning
    /// of the task within its ready queue.
    pub fn resume_task(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &mut self.tasks[usize::from(id)];
        if !task.state.contains(TaskState::SUSPEND) {
            return Err(Error::IllegalUse);
        }
        task.state -= TaskState::SUSPEND;
        if task.state.is_empty() {
            self.mark_runnable(id);
        }
        self.yield_if_needed();
        Ok(())
    }

    /// Change a task's base priority, recomputing its effective priority if
    /// it owns no boost-granting mutexes (§6 `change_priority`, §4.5).
    pub fn change_task_priority(&mut self, handle: TaskHandle, priority: u8) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        if priority as usize >= NPRIO {
            return Err(Error::WrongParameter);
        }
        let id = self.validate(handle)?;
        self.tasks[usize::from(id)].base_priority = priority;
        let recomputed = self.compute_effective_priority(id);
        self.reschedule_for_priority_change(id, recomputed);
        crate::wait::reorder_wait_of_task(self, id);
        self.yield_if_needed();
        Ok(())
    }

    /// Move a task to Dormant, releasing every mutex it holds (§6
    /// `terminate`, §4.5 "When a task exits").
    pub fn terminate_task(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &self.tasks[usize::from(id)];
        if task.state.contains(TaskState::DORMANT) {
            return Err(Error::IllegalUse);
        }
        if task.state.contains(TaskState::WAIT) {
            self.abort_wait_for_exit(id);
        }
        if self.tasks[usize::from(id)].state.contains(TaskState::RUNNABLE) {
            self.clear_runnable(id);
        }
        self.release_all_owned_mutexes(id);

        let task = &mut self.tasks[usize::from(id)];
        task.state = TaskState::DORMANT;
        task.effective_priority = task.base_priority;
        if self.current == Some(id) {
            self.current = None;
        }
        self.yield_if_needed();
        Ok(())
    }

    /// Free a Dormant task's slot for reuse (§6 `delete`).
    pub fn delete_task(&mut self, handle: TaskHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate(handle)?;
        let task = &self.tasks[usize::from(id)];
        if !task.state.contains(TaskState::DORMANT) {
            return Err(Error::IllegalUse);
        }
        self.all_tasks
            .unlink(&mut self.tasks[..], id, registry_link_of);
        let task = &mut self.tasks[usize::from(id)];
        task.exists = false;
        task.id_tag = 0;
        task.stack_context = None;
        Ok(())
    }

    pub(crate) fn next_id_tag(&mut self) -> u32 {
        self.id_tag_counter = self.id_tag_counter.wrapping_add(1).max(1);
        self.id_tag_counter
    }
}
