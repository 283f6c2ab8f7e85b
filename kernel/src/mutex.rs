//! Mutexes: priority-ceiling and priority-inheritance protocols, plus the
//! deadlock detector (§3 "Mutex", §4.5-§4.7).
use crate::error::{Error, Result, WaitResult};
use crate::port::Port;
use crate::state::{CriticalSection, Kernel};
use crate::task::{TaskId, TaskState};
use crate::time::Timeout;
use crate::utils::intrusive_list::{List, ListLink};
use crate::wait::WaitReason;

/// An index into [`Kernel`]'s mutex array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MutexId(pub(crate) u16);

impl From<MutexId> for usize {
    fn from(id: MutexId) -> usize {
        id.0 as usize
    }
}

impl From<usize> for MutexId {
    fn from(i: usize) -> MutexId {
        MutexId(i as u16)
    }
}

/// An opaque, user-facing reference to a mutex, guarded by an identity tag
/// (§7) the same way [`crate::task::TaskHandle`] guards a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexHandle {
    pub(crate) id: MutexId,
    pub(crate) tag: u32,
}

/// Which locking discipline a mutex uses to bound priority inversion (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// The holder's effective priority is boosted to the highest priority
    /// among tasks currently blocked on it, transitively across a chain of
    /// held mutexes.
    Inherit,
    /// The holder's effective priority is boosted to a fixed ceiling the
    /// instant it acquires the mutex, regardless of who (if anyone) is
    /// waiting.
    Ceiling,
}

/// The mutex control block (§3 "Mutex").
pub(crate) struct Mutex {
    pub(crate) exists: bool,
    pub(crate) id_tag: u32,
    pub(crate) protocol: Protocol,
    pub(crate) ceiling: u8,
    pub(crate) holder: Option<TaskId>,
    pub(crate) recursive_count: u32,
    pub(crate) wait_queue: List<TaskId>,
    /// Membership in the holder's [`crate::task::Task::owned_mutexes`] list.
    pub(crate) owner_link: ListLink<MutexId>,
}

impl Mutex {
    pub(crate) const fn unused() -> Self {
        Self {
            exists: false,
            id_tag: 0,
            protocol: Protocol::Inherit,
            ceiling: 0,
            holder: None,
            recursive_count: 0,
            wait_queue: List::new(),
            owner_link: ListLink::new(),
        }
    }
}

/// Field accessor for a mutex's membership in a task's owned-mutex list.
pub(crate) fn owner_link_of(m: &mut Mutex) -> &mut ListLink<MutexId> {
    &mut m.owner_link
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
    fn validate_mutex(&self, handle: MutexHandle) -> Result<MutexId> {
        let mutex = &self.mutexes[usize::from(handle.id)];
        if cfg!(feature = "object_ids") && (!mutex.exists || mutex.id_tag != handle.tag) {
            Err(Error::InvalidObject)
        } else {
            Ok(handle.id)
        }
    }

    /// Create a mutex (§6 `create_mutex`). `ceiling` is meaningful only for
    /// [`Protocol::Ceiling`].
    pub fn create_mutex(&mut self, protocol: Protocol, ceiling: u8) -> Result<MutexHandle> {
        let _cs = CriticalSection::<P>::enter();
        if ceiling as usize >= NPRIO {
            return Err(Error::WrongParameter);
        }
        let slot = (0..NMUTEXES)
            .find(|&i| !self.mutexes[i].exists)
            .ok_or(Error::Overflow)?;
        let id_tag = self.next_id_tag();
        self.mutexes[slot] = Mutex {
            exists: true,
            id_tag,
            protocol,
            ceiling,
            holder: None,
            recursive_count: 0,
            wait_queue: List::new(),
            owner_link: ListLink::new(),
        };
        Ok(MutexHandle {
            id: MutexId(slot as u16),
            tag: id_tag,
        })
    }

    /// Delete a mutex. If it is currently locked, every waiter is released
    /// with `DELETED`, the holder's ownership membership is cleared, and
    /// the holder's effective priority is recomputed (§4.5 "Deletion of a
    /// locked mutex").
    pub fn delete_mutex(&mut self, handle: MutexHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_mutex(handle)?;
        let mut queue = core::mem::replace(&mut self.mutexes[usize::from(id)].wait_queue, List::new());
        self.wait_queue_notify_deleted(&mut queue);

        if let Some(holder) = self.mutexes[usize::from(id)].holder {
            self.tasks[usize::from(holder)]
                .owned_mutexes
                .unlink(&mut self.mutexes[..], id, owner_link_of);
            let new_pri = self.compute_effective_priority(holder);
            self.reschedule_for_priority_change(holder, new_pri);
        }

        let mutex = &mut self.mutexes[usize::from(id)];
        mutex.exists = false;
        mutex.id_tag = 0;
        mutex.holder = None;
        self.yield_if_needed();
        Ok(())
    }

    /// `lock` (§4.5 "common", on `lock`).
    pub fn mutex_lock(&mut self, handle: MutexHandle, timeout: Timeout) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_mutex(handle)?;
        let h = self.current.ok_or(Error::InterruptContext)?;

        match self.mutexes[usize::from(id)].holder {
            None => {
                self.install_as_holder(id, h);
                self.yield_if_needed();
                Ok(())
            }
            Some(holder) if holder == h => {
                if cfg!(feature = "recursive_mutex") {
                    self.mutexes[usize::from(id)].recursive_count += 1;
                    Ok(())
                } else {
                    Err(Error::IllegalUse)
                }
            }
            Some(holder) => {
                if timeout.is_poll() {
                    return Err(Error::Timeout);
                }
                if self.mutexes[usize::from(id)].protocol == Protocol::Inherit {
                    self.propagate_priority_boost(h, holder);
                }
                self.block_current(WaitReason::Mutex(id), timeout).into_result()
            }
        }
    }

    /// `unlock` (§4.5 "common", on `unlock`).
    pub fn mutex_unlock(&mut self, handle: MutexHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_mutex(handle)?;
        let h = self.current.ok_or(Error::InterruptContext)?;

        if self.mutexes[usize::from(id)].holder != Some(h) {
            return Err(Error::IllegalUse);
        }

        self.mutexes[usize::from(id)].recursive_count -= 1;
        if self.mutexes[usize::from(id)].recursive_count > 0 {
            return Ok(());
        }

        self.tasks[usize::from(h)]
            .owned_mutexes
            .unlink(&mut self.mutexes[..], id, owner_link_of);
        self.mutexes[usize::from(id)].holder = None;

        let new_pri = self.compute_effective_priority(h);
        self.reschedule_for_priority_change(h, new_pri);

        let mut queue = core::mem::replace(&mut self.mutexes[usize::from(id)].wait_queue, List::new());
        if let Some(next_holder) = self.wait_queue_pop_front(&mut queue) {
            self.mutexes[usize::from(id)].wait_queue = queue;
            self.install_as_holder(id, next_holder);
            self.finish_wait(next_holder, WaitResult::Ok);
            let recomputed = self.compute_effective_priority(next_holder);
            self.reschedule_for_priority_change(next_holder, recomputed);
        } else {
            self.mutexes[usize::from(id)].wait_queue = queue;
        }

        self.yield_if_needed();
        Ok(())
    }

    /// Release every mutex `task` currently owns, as happens on task exit
    /// (§4.5 "When a task exits").
    pub(crate) fn release_all_owned_mutexes(&mut self, task: TaskId) {
        loop {
            let Some(id) = self.tasks[usize::from(task)].owned_mutexes.front() else {
                break;
            };
            self.tasks[usize::from(task)]
                .owned_mutexes
                .unlink(&mut self.mutexes[..], id, owner_link_of);
            self.mutexes[usize::from(id)].holder = None;
            self.mutexes[usize::from(id)].recursive_count = 0;

            let mut queue = core::mem::replace(&mut self.mutexes[usize::from(id)].wait_queue, List::new());
            if let Some(next_holder) = self.wait_queue_pop_front(&mut queue) {
                self.mutexes[usize::from(id)].wait_queue = queue;
                self.install_as_holder(id, next_holder);
                self.finish_wait(next_holder, WaitResult::Ok);
                let recomputed = self.compute_effective_priority(next_holder);
                self.reschedule_for_priority_change(next_holder, recomputed);
            } else {
                self.mutexes[usize::from(id)].wait_queue = queue;
            }
        }
        let new_pri = self.compute_effective_priority(task);
        self.tasks[usize::from(task)].effective_priority = new_pri;
    }

    fn install_as_holder(&mut self, id: MutexId, task: TaskId) {
        let protocol = self.mutexes[usize::from(id)].protocol;
        let ceiling = self.mutexes[usize::from(id)].ceiling;

        self.mutexes[usize::from(id)].holder = Some(task);
        self.mutexes[usize::from(id)].recursive_count = 1;
        self.tasks[usize::from(task)]
            .owned_mutexes
            .push_back(&mut self.mutexes[..], id, owner_link_of);

        if protocol == Protocol::Ceiling && (self.tasks[usize::from(task)].effective_priority as usize) > ceiling as usize {
            self.boost_task_priority(task, ceiling);
        }
    }

    /// The maximum priority (numerically smallest) `task` is entitled to,
    /// over its base priority and every ceiling/inheritance obligation it
    /// still carries (§4.5 "On unlock", the `recompute effective_priority`
    /// step).
    ///
    /// Wait queues in this kernel are strictly FIFO (§4.1), so an
    /// inheritance mutex's highest-priority waiter is not necessarily at the
    /// head — this scans every waiter rather than reading `front()`, the way
    /// a priority-walk over an unordered wait list has to.
    pub(crate) fn compute_effective_priority(&self, task: TaskId) -> u8 {
        let mut best = self.tasks[usize::from(task)].base_priority;

        let mut cur = self.tasks[usize::from(task)].owned_mutexes.front();
        while let Some(id) = cur {
            let mutex = &self.mutexes[usize::from(id)];
            match mutex.protocol {
                Protocol::Ceiling => best = best.min(mutex.ceiling),
                Protocol::Inherit => {
                    for waiter in mutex.wait_queue.iter(&self.tasks[..], crate::task::queue_link_ref) {
                        best = best.min(self.tasks[usize::from(waiter)].effective_priority);
                    }
                }
            }
            cur = mutex.owner_link.next;
        }
        best
    }

    fn boost_task_priority(&mut self, task: TaskId, new_priority: u8) {
        if self.tasks[usize::from(task)].effective_priority == new_priority {
            return;
        }
        if self.tasks[usize::from(task)].state.contains(TaskState::RUNNABLE) {
            self.reschedule_for_priority_change(task, new_priority);
        } else {
            self.tasks[usize::from(task)].effective_priority = new_priority;
        }
        crate::wait::reorder_wait_of_task(self, task);
    }

    /// Walk the chain of held mutexes starting at `holder`, boosting each
    /// link's effective priority to (at least) `waiter`'s, until the chain
    /// terminates or revisits a task already seen — a cycle, i.e. deadlock
    /// (§4.5 last paragraph, §4.7).
    fn propagate_priority_boost(&mut self, waiter: TaskId, holder: TaskId) {
        let boost_pri = self.tasks[usize::from(waiter)].effective_priority;

        let mut seen = alloc_visited::<NTASKS>();
        seen[usize::from(waiter)] = true;

        let mut cur = holder;
        loop {
            if seen[usize::from(cur)] {
                self.report_deadlock(&seen);
                return;
            }
            seen[usize::from(cur)] = true;

            if self.tasks[usize::from(cur)].effective_priority <= boost_pri {
                return;
            }
            self.boost_task_priority(cur, boost_pri);

            match self.tasks[usize::from(cur)].wait_reason {
                WaitReason::Mutex(next_mutex) => match self.mutexes[usize::from(next_mutex)].holder {
                    Some(next_holder) => cur = next_holder,
                    None => return,
                },
                _ => return,
            }
        }
    }

    #[cfg(feature = "deadlock_detection")]
    fn report_deadlock(&mut self, participants: &[bool; NTASKS]) {
        let was_active = self.deadlock_active;
        self.deadlock_active = true;
        for (i, &p) in participants.iter().enumerate() {
            if p {
                self.deadlock_participants[i] = true;
            }
        }
        if !was_active {
            if let Some(cb) = self.deadlock_callback {
                cb(true);
            }
        }
    }

    #[cfg(not(feature = "deadlock_detection"))]
    fn report_deadlock(&mut self, _participants: &[bool; NTASKS]) {}
}

/// `[false; NTASKS]` by another name: a free function keeps the const
/// generic inference local to the one call site that needs it.
fn alloc_visited<const NTASKS: usize>() -> [bool; NTASKS] {
    [false; NTASKS]
}
