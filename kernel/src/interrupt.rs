//! The ISR boundary: nesting counter and deferred context switch (§4.9).
//!
//! A task-context service that makes a task runnable calls `yield_if_needed`
//! immediately, which may context-switch right there. The same service
//! called from inside an ISR must not switch stacks until the *outermost*
//! `exit_isr` — the kernel may be several ISRs deep, each holding
//! architecture state the switch would clobber — so `yield_if_needed` just
//! leaves `next` set and `exit_isr` does the one switch an interrupt handler
//! is allowed to trigger (§9 "Deferred context switch from ISRs").
use crate::port::Port;
use crate::state::{CriticalSection, Kernel};

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
    /// Mark entry into an interrupt service routine. Must be the first
    /// thing an ISR does, before calling any other kernel service.
    pub fn enter_isr(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        self.isr_nest_count += 1;
    }

    /// Mark exit from an interrupt service routine. On the outermost exit
    /// (`isr_nest_count` reaching zero), performs the context switch any
    /// nested `*_isr` service deferred while an ISR was in progress.
    ///
    /// # Panics
    ///
    /// Panics if called without a matching `enter_isr` — an unbalanced
    /// nesting counter is a kernel-integration bug, not a runtime condition
    /// to recover from.
    pub fn exit_isr(&mut self) {
        let _cs = CriticalSection::<P>::enter();
        self.isr_nest_count = self
            .isr_nest_count
            .checked_sub(1)
            .expect("exit_isr called without a matching enter_isr");
        if self.isr_nest_count == 0 {
            self.dispatch();
        }
    }

    /// Whether the caller is currently inside any ISR nesting level.
    pub fn in_isr(&self) -> bool {
        self.isr_nest_count > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy)]
    struct TestContext(u32);

    struct TestPort;
    impl Port for TestPort {
        type Mask = ();
        type StackContext = TestContext;

        fn disable_interrupts() {}
        fn restore_interrupts(_mask: ()) {}
        fn is_in_isr() -> bool {
            false
        }
        unsafe fn initialize_stack(
            _stack_top: *mut u8,
            _stack_size: usize,
            _entry: fn(usize),
            _arg: usize,
        ) -> TestContext {
            TestContext(0)
        }
        fn context_switch(_from: Option<&mut TestContext>, _to: &TestContext) {}
        fn context_switch_now_nosave(_to: &TestContext) -> ! {
            panic!("not exercised by these tests")
        }
    }

    type TestKernel = Kernel<TestPort, 4, 4, 1, 1, 1, 8>;

    #[test]
    fn nested_isr_defers_dispatch_to_outermost_exit() {
        let mut k = TestKernel::new();
        let sem = k.create_semaphore(0, 1).unwrap();

        k.enter_isr();
        k.enter_isr();
        // Would normally want to dispatch, but nesting defers it.
        k.semaphore_signal_isr(sem).unwrap();
        k.exit_isr();
        assert!(k.in_isr());
        k.exit_isr();
        assert!(!k.in_isr());
    }

    #[test]
    #[should_panic]
    fn unbalanced_exit_panics() {
        let mut k = TestKernel::new();
        k.exit_isr();
    }
}
