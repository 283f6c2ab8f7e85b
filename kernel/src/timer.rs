//! The tick-driven timer wheel (§3 "Timer", §4.8).
//!
//! One generic wheel implementation, [`Wheel`], backs two independent
//! instances inside [`crate::state::Kernel`]: one keyed by [`TimerId`] for
//! application-visible software timers, and one keyed by
//! [`crate::task::TaskId`] for the implicit timeout slot every task carries
//! while blocked with a finite timeout. Both pay the same O(1) expected
//! per-tick cost regardless of how many timers are armed.
use arrayvec::ArrayVec;

use crate::error::{Error, Result};
use crate::port::Port;
use crate::state::{CriticalSection, Kernel};
use crate::time::Tick;
use crate::utils::intrusive_list::{List, ListLink};

/// Where a timer currently lives, so [`Wheel::cancel`] knows which list to
/// unlink it from without a linear search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerLocation {
    None,
    Wheel(u16),
    Overflow,
}

/// The embedded state a timer (user or task-implicit) needs to participate
/// in a [`Wheel`] (§3 "Timer": "list node, fire-time, ... active flag").
pub(crate) struct TimerNode<Idx> {
    pub(crate) fire_time: Tick,
    pub(crate) link: ListLink<Idx>,
    pub(crate) location: TimerLocation,
    pub(crate) active: bool,
}

impl<Idx> TimerNode<Idx> {
    pub(crate) const fn unused() -> Self {
        Self {
            fire_time: Tick::ZERO,
            link: ListLink::new(),
            location: TimerLocation::None,
            active: false,
        }
    }
}

/// A tick wheel of `N` slots plus an overflow list (§4.8).
pub(crate) struct Wheel<Idx, const N: usize> {
    slots: [List<Idx>; N],
    overflow: List<Idx>,
}

impl<Idx: Into<usize> + From<usize> + Copy + Eq, const N: usize> Wheel<Idx, N> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [List::new(); N],
            overflow: List::new(),
        }
    }

    /// `start(timer, T)` (§4.8): cancel if already active, then place into
    /// the wheel or the overflow list depending on whether `T < N`.
    pub(crate) fn start<T>(
        &mut self,
        pool: &mut [T],
        idx: Idx,
        now: Tick,
        ticks: u32,
        node_of: impl Fn(&mut T) -> &mut TimerNode<Idx> + Copy,
    ) {
        self.cancel(pool, idx, node_of);
        let fire_time = now + ticks;
        {
            let node = node_of(&mut pool[idx.into()]);
            node.fire_time = fire_time;
            node.active = true;
        }
        if (ticks as usize) < N {
            let slot = (fire_time.0 as usize) % N;
            self.slots[slot].push_back(pool, idx, |t| &mut node_of(t).link);
            node_of(&mut pool[idx.into()]).location = TimerLocation::Wheel(slot as u16);
        } else {
            self.overflow.push_back(pool, idx, |t| &mut node_of(t).link);
            node_of(&mut pool[idx.into()]).location = TimerLocation::Overflow;
        }
    }

    /// `cancel(timer)` (§4.8): unlink and clear active; returns whether it
    /// was active.
    pub(crate) fn cancel<T>(
        &mut self,
        pool: &mut [T],
        idx: Idx,
        node_of: impl Fn(&mut T) -> &mut TimerNode<Idx> + Copy,
    ) -> bool {
        let location = node_of(&mut pool[idx.into()]).location;
        match location {
            TimerLocation::None => false,
            TimerLocation::Wheel(slot) => {
                self.slots[slot as usize].unlink(pool, idx, |t| &mut node_of(t).link);
                let node = node_of(&mut pool[idx.into()]);
                node.active = false;
                node.location = TimerLocation::None;
                true
            }
            TimerLocation::Overflow => {
                self.overflow.unlink(pool, idx, |t| &mut node_of(t).link);
                let node = node_of(&mut pool[idx.into()]);
                node.active = false;
                node.location = TimerLocation::None;
                true
            }
        }
    }

    /// `time_left` (§4.8): valid only while active.
    pub(crate) fn time_left<T>(
        &self,
        pool: &[T],
        idx: Idx,
        now: Tick,
        node_ref_of: impl Fn(&T) -> &TimerNode<Idx>,
    ) -> u32 {
        let node = node_ref_of(&pool[idx.into()]);
        if !node.active {
            return 0;
        }
        node.fire_time.saturating_until(now)
    }

    /// Per-tick processing, steps 1-2 of §4.8 (the `now` increment is the
    /// caller's responsibility): collect every timer due exactly at `now`
    /// out of the current slot, unlinking and deactivating each. Firing the
    /// timer (a callback, or completing a task's wait) is left to the
    /// caller, since it generally needs more context than a bare `&mut [T]`
    /// slice gives this method — the fired indices are handed back instead.
    pub(crate) fn collect_due<T, const CAP: usize>(
        &mut self,
        pool: &mut [T],
        now: Tick,
        node_of: impl Fn(&mut T) -> &mut TimerNode<Idx> + Copy,
    ) -> ArrayVec<Idx, CAP> {
        let mut fired = ArrayVec::new();
        let slot = (now.0 as usize) % N;
        loop {
            let Some(idx) = self.slots[slot].front() else {
                break;
            };
            let fire_time = node_of(&mut pool[idx.into()]).fire_time;
            if fire_time != now {
                // Can't happen by construction (§4.8 step 2) unless the
                // timer was rescheduled; leave it for its real slot visit.
                break;
            }
            self.slots[slot].unlink(pool, idx, |t| &mut node_of(t).link);
            let node = node_of(&mut pool[idx.into()]);
            node.active = false;
            node.location = TimerLocation::None;
            fired.push(idx);
        }

        if now.0 as usize % N == 0 {
            self.migrate_overflow(pool, now, node_of);
        }

        fired
    }

    /// §4.8 step 3: once per full revolution, move overflow timers that
    /// have come within wheel range into their slot.
    fn migrate_overflow<T>(
        &mut self,
        pool: &mut [T],
        now: Tick,
        node_of: impl Fn(&mut T) -> &mut TimerNode<Idx> + Copy,
    ) {
        let mut cur = self.overflow.front();
        while let Some(idx) = cur {
            let node = node_of(&mut pool[idx.into()]);
            let next = node.link.next;
            let remaining = node.fire_time.saturating_until(now);

            if (remaining as usize) < N {
                self.overflow.unlink(pool, idx, |t| &mut node_of(t).link);
                let slot = (node_of(&mut pool[idx.into()]).fire_time.0 as usize) % N;
                self.slots[slot].push_back(pool, idx, |t| &mut node_of(t).link);
                node_of(&mut pool[idx.into()]).location = TimerLocation::Wheel(slot as u16);
            }
            cur = next;
        }
    }
}

/// An index into [`Kernel`]'s application-timer array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(pub(crate) u16);

impl From<TimerId> for usize {
    fn from(id: TimerId) -> usize {
        id.0 as usize
    }
}
impl From<usize> for TimerId {
    fn from(i: usize) -> TimerId {
        TimerId(i as u16)
    }
}

/// An opaque, user-facing reference to a software timer (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    pub(crate) id: TimerId,
    pub(crate) tag: u32,
}

/// An application-visible software timer (§3 "Timer").
pub(crate) struct Timer {
    pub(crate) exists: bool,
    pub(crate) id_tag: u32,
    pub(crate) node: TimerNode<TimerId>,
    pub(crate) period: Option<u32>,
    /// `(timer_handle, user_pointer)` (§6 "Tick timer callback contract").
    pub(crate) callback: fn(TimerHandle, usize),
    pub(crate) user_data: usize,
}

impl Timer {
    pub(crate) const fn unused() -> Self {
        Self {
            exists: false,
            id_tag: 0,
            node: TimerNode::unused(),
            period: None,
            callback: |_, _| {},
            user_data: 0,
        }
    }
}

pub(crate) fn timer_node_of(t: &mut Timer) -> &mut TimerNode<TimerId> {
    &mut t.node
}
pub(crate) fn timer_node_ref_of(t: &Timer) -> &TimerNode<TimerId> {
    &t.node
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
    fn validate_timer(&self, handle: TimerHandle) -> Result<TimerId> {
        let timer = &self.timers[usize::from(handle.id)];
        if cfg!(feature = "object_ids") && (!timer.exists || timer.id_tag != handle.tag) {
            Err(Error::InvalidObject)
        } else {
            Ok(handle.id)
        }
    }

    /// Create a one-shot or periodic software timer in the stopped state
    /// (§6 `create_timer`). `period` re-arms the timer for another
    /// `period` ticks each time it fires; `None` leaves it one-shot.
    pub fn create_timer(
        &mut self,
        callback: fn(TimerHandle, usize),
        user_data: usize,
        period: Option<u32>,
    ) -> Result<TimerHandle> {
        let _cs = CriticalSection::<P>::enter();
        let slot = (0..NTIMERS)
            .find(|&i| !self.timers[i].exists)
            .ok_or(Error::Overflow)?;
        let id_tag = self.next_id_tag();
        self.timers[slot] = Timer {
            exists: true,
            id_tag,
            node: TimerNode::unused(),
            period,
            callback,
            user_data,
        };
        Ok(TimerHandle {
            id: TimerId(slot as u16),
            tag: id_tag,
        })
    }

    /// `start(timer, T)` (§4.8).
    pub fn timer_start(&mut self, handle: TimerHandle, ticks: u32) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_timer(handle)?;
        let now = self.now;
        self.timer_wheel
            .start(&mut self.timers[..], id, now, ticks, timer_node_of);
        Ok(())
    }

    /// `cancel(timer)` (§4.8). Returns whether it was active.
    pub fn timer_cancel(&mut self, handle: TimerHandle) -> Result<bool> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_timer(handle)?;
        Ok(self.timer_wheel.cancel(&mut self.timers[..], id, timer_node_of))
    }

    /// `time_left` (§4.8).
    pub fn timer_time_left(&self, handle: TimerHandle) -> Result<u32> {
        let id = self.validate_timer(handle)?;
        Ok(self
            .timer_wheel
            .time_left(&self.timers[..], id, self.now, timer_node_ref_of))
    }

    pub fn delete_timer(&mut self, handle: TimerHandle) -> Result<()> {
        let _cs = CriticalSection::<P>::enter();
        let id = self.validate_timer(handle)?;
        self.timer_wheel.cancel(&mut self.timers[..], id, timer_node_of);
        let timer = &mut self.timers[usize::from(id)];
        timer.exists = false;
        timer.id_tag = 0;
        Ok(())
    }

    /// Advance the tick counter by one and run both wheels' per-tick work
    /// (§4.8). Called from `sys_tick_int_processing` while inside
    /// `enter_isr`/`exit_isr` (§4.9); fired callbacks run with interrupts
    /// still masked and must not block (§4.8 last line).
    pub(crate) fn advance_tick(&mut self) {
        self.now = self.now + 1;
        let now = self.now;

        let fired_timers: ArrayVec<TimerId, NTIMERS> =
            self.timer_wheel
                .collect_due(&mut self.timers[..], now, timer_node_of);
        for id in fired_timers {
            let timer = &self.timers[usize::from(id)];
            (timer.callback)(
                TimerHandle {
                    id,
                    tag: timer.id_tag,
                },
                timer.user_data,
            );
            if let Some(period) = self.timers[usize::from(id)].period {
                self.timer_wheel
                    .start(&mut self.timers[..], id, now, period, timer_node_of);
            }
        }

        let fired_timeouts: ArrayVec<crate::task::TaskId, NTASKS> = self
            .task_timeout_wheel
            .collect_due(&mut self.tasks[..], now, crate::task::timeout_node_of);
        for id in fired_timeouts {
            self.complete_wait(id, crate::error::WaitResult::Timeout);
        }

        self.yield_if_needed();
    }

    pub(crate) fn arm_task_timeout(&mut self, task: crate::task::TaskId, ticks: u32) {
        let now = self.now;
        self.task_timeout_wheel
            .start(&mut self.tasks[..], task, now, ticks, crate::task::timeout_node_of);
    }

    pub(crate) fn cancel_task_timeout(&mut self, task: crate::task::TaskId) {
        self.task_timeout_wheel
            .cancel(&mut self.tasks[..], task, crate::task::timeout_node_of);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct Idx(u8);
    impl From<Idx> for usize {
        fn from(i: Idx) -> usize {
            i.0 as usize
        }
    }
    impl From<usize> for Idx {
        fn from(i: usize) -> Idx {
            Idx(i as u8)
        }
    }

    struct Slot {
        node: TimerNode<Idx>,
    }

    fn node_of(s: &mut Slot) -> &mut TimerNode<Idx> {
        &mut s.node
    }

    const POOL_SIZE: usize = 6;
    const WHEEL_SIZE: usize = 4;

    fn make_pool() -> Vec<Slot> {
        (0..POOL_SIZE).map(|_| Slot { node: TimerNode::unused() }).collect()
    }

    #[test]
    fn ticks_equal_to_wheel_size_starts_in_overflow_not_the_wheel() {
        // §8: `ticks < N` goes straight into a slot; `ticks == N` must not,
        // since a timer placed in slot `(now + N) % N == now % N` would be
        // indistinguishable from one already due *this* revolution.
        let mut pool = make_pool();
        let mut wheel: Wheel<Idx, WHEEL_SIZE> = Wheel::new();
        wheel.start(&mut pool, Idx(0), Tick::ZERO, WHEEL_SIZE as u32, node_of);
        assert_eq!(pool[0].node.location, TimerLocation::Overflow);

        let mut now = Tick::ZERO;
        let mut fired = Vec::new();
        for _ in 0..WHEEL_SIZE {
            now = now + 1;
            let due: ArrayVec<Idx, POOL_SIZE> = wheel.collect_due(&mut pool, now, node_of);
            fired.extend(due);
        }
        assert_eq!(fired, vec![Idx(0)], "a timer armed for exactly N ticks must fire on the Nth tick");
    }

    /// Drives a [`Wheel`] through a random sequence of `start`/`cancel`
    /// calls, one tick apart, against a plain `(idx -> absolute fire tick)`
    /// map. `ticks` is drawn up to well past `WHEEL_SIZE`, so most runs visit
    /// the overflow list and its migration back into a slot at least once.
    #[quickcheck]
    fn matches_reference_model(ops: Vec<(bool, u8, u8)>) -> bool {
        use std::collections::BTreeMap;

        let mut pool = make_pool();
        let mut wheel: Wheel<Idx, WHEEL_SIZE> = Wheel::new();
        let mut now = Tick::ZERO;
        let mut model: BTreeMap<u8, u32> = BTreeMap::new();

        for (start, idx_raw, ticks_raw) in ops {
            let idx_u8 = idx_raw % (POOL_SIZE as u8);
            let idx = Idx(idx_u8);

            now = now + 1;
            let due: ArrayVec<Idx, POOL_SIZE> = wheel.collect_due(&mut pool, now, node_of);
            let mut fired: Vec<u8> = due.iter().map(|i| i.0).collect();
            fired.sort_unstable();

            let mut expected: Vec<u8> = model
                .iter()
                .filter(|&(_, &t)| t == now.0)
                .map(|(&k, _)| k)
                .collect();
            expected.sort_unstable();
            if fired != expected {
                return false;
            }
            for k in &expected {
                model.remove(k);
            }

            if start {
                let ticks = (ticks_raw % 40) as u32;
                wheel.start(&mut pool, idx, now, ticks, node_of);
                model.insert(idx_u8, now.0.wrapping_add(ticks));
            } else {
                wheel.cancel(&mut pool, idx, node_of);
                model.remove(&idx_u8);
            }
        }
        true
    }
}
