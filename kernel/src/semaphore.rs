//! Counting semaphores (§3 "Semaphore", §4.4).
use crate::error::{Error, Result, WaitResult};
use crate::port::Port;
use crate::state::{CriticalSection, Kernel};
use crate::time::Timeout;
use crate::utils::intrusive_list::List;
use crate::wait::WaitReason;

/// An index into [`Kernel`]'s semaphore array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemaphoreId(pub(crate) u16);

impl From<SemaphoreId> for usize {
    fn from(id: SemaphoreId) -> usize {
        id.0 as usize
    }
}

/// An opaque, user-facing reference to a semaphore, guarded by an identity
/// tag the same way [`TaskHandle`] guards a task (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreHandle {
    pub(crate) id: SemaphoreId,
    pub(crate) tag: u32,
}

/// The semaphore control block (§3 "Semaphore").
pub(crate) struct Semaphore {
    pub(crate) exists: bool,
    pub(crate) id_tag: u32,
    pub(crate) count: u32,
    pub(crate) max_count: u32,
    pub(crate) wait_queue: List<crate::task::TaskId>,
}

impl Semaphore {
    pub(crate) const fn unused() -> Self {
        Self {
            exists: false,
            id_tag: 0,
            count: 0,
            max_count: 0,
            wait_queue: List::new(),
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
    fn validate_semaphore(&self, handle: SemaphoreHandle) -> Result<SemaphoreId> {
        let sem = &self.semaphores[usize::from(handle.id)];
        if cfg!(feature = "object_ids") && (!sem.exists || sem.id_tag != handle.tag) {
            Err(Error::InvalidObject)
        } else {
            Ok(handle.id)
        }
    }

    /// Create a semaphore with the given initial and maximum count (§6
    /// `create_semaphore`).
    pub fn create_semaphore(&mut self, initial_count: u32, max_count: u32) -> Result<SemaphoreHandle> {
        let _cs = CriticalSection::<P>::enter();
        if initial_count > max_count {
            return Err(Error::WrongParameter);
        }
        let slot = (0..NSEMS)
            .find(|&i| !self.semaphores[i].exists)
            .ok_or(Error::Overflow)?;
        let id_tag = self.next_id_tag();
        self.semaphores[slot] = Semaphore {
            exists: true,
            id_tag,
            count: initial_count,
            max_count,
            wait_queue: List::new(),
        };
        Ok(SemaphoreHandle {
            id: SemaphoreId(slot as u16),
            tag: id_tag,
        })
    }

    /// Delete a semaphore, releasing every waiter with `DELETED` (§6
    /// `delete_semaphore`).
    pub fn delete_semaphore(&mut self, handle: SemaphoreHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_semaphore(handle)?;
        let mut queue = core::mem::replace(
            &mut self.semaphores[usize::from(id)].wait_queue,
            List::new(),
        );
        self.wait_queue_notify_deleted(&mut queue);
        let sem = &mut self.semaphores[usize::from(id)];
        sem.exists = false;
        sem.id_tag = 0;
        self.yield_if_needed();
        Ok(())
    }

    /// `signal` (§4.4): increment the count unless a waiter can take the
    /// credit directly, in which case the waiter is woken instead and the
    /// count is left unchanged. Fails with `OVERFLOW` if the count is
    /// already at `max_count` and nobody is waiting.
    pub fn semaphore_signal(&mut self, handle: SemaphoreHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_semaphore(handle)?;
        self.signal_semaphore_id(id)?;
        self.yield_if_needed();
        Ok(())
    }

    /// ISR variant of [`Self::semaphore_signal`]: identical state
    /// transition, but never synchronously switches context — the caller
    /// is expected to be inside `enter_isr`/`exit_isr` already, and
    /// `exit_isr` performs the deferred switch (§4.4, §4.9).
    pub fn semaphore_signal_isr(&mut self, handle: SemaphoreHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_semaphore(handle)?;
        self.signal_semaphore_id(id)?;
        Ok(())
    }

    fn signal_semaphore_id(&mut self, id: SemaphoreId) -> Result<()> {
        let mut queue = core::mem::replace(
            &mut self.semaphores[usize::from(id)].wait_queue,
            List::new(),
        );
        let woken = self.wait_queue_pop_front(&mut queue);
        self.semaphores[usize::from(id)].wait_queue = queue;

        if let Some(waiter) = woken {
            self.finish_wait(waiter, WaitResult::Ok);
        } else {
            let sem = &mut self.semaphores[usize::from(id)];
            if sem.count >= sem.max_count {
                return Err(Error::Overflow);
            }
            sem.count += 1;
        }
        Ok(())
    }

    /// `acquire` (§4.4): succeed immediately if the count is positive,
    /// otherwise block with reason `SEM` (or return `TIMEOUT` immediately
    /// for a zero-tick poll).
    pub fn semaphore_acquire(&mut self, handle: SemaphoreHandle, timeout: Timeout) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_semaphore(handle)?;
        let sem = &mut self.semaphores[usize::from(id)];
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(());
        }
        if timeout.is_poll() {
            return Err(Error::Timeout);
        }
        if self.current.is_none() {
            return Err(Error::InterruptContext);
        }
        self.block_current(WaitReason::Semaphore(id), timeout)
            .into_result()
    }

    /// The current count, for diagnostics or `poll`-style callers that
    /// want to check without blocking.
    pub fn semaphore_count(&self, handle: SemaphoreHandle) -> Result<u32> {
        let id = self.validate_semaphore(handle)?;
        Ok(self.semaphores[usize::from(id)].count)
    }
    // Read-only and single-`u32`-sized, so torn reads aren't a concern even
    // without a guard here; every mutator still takes one.
}
