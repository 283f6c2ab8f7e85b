//! End-to-end exercise of the hosted port against the kernel's public API:
//! one task that counts up and sleeps, observed from the test thread.
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use rkos_kernel::port::Port;
use rkos_kernel::state::Kernel;
use rkos_port_std::StdPort;

type TestKernel = Kernel<StdPort, 4, 4, 1, 1, 1, 16>;

static TICKS_SEEN: AtomicU32 = AtomicU32::new(0);
static IDLE_STACK: [u8; 32 * 1024] = [0; 32 * 1024];
static WORKER_STACK: [u8; 32 * 1024] = [0; 32 * 1024];

fn counting_task(_arg: usize) {
    loop {
        TICKS_SEEN.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// `&'static mut` over a `static` region is normally unsound to construct
/// twice, but each stack in this module backs exactly one task for the
/// lifetime of the process, so there is only ever one live reference to a
/// given region. `create_task`'s own safety contract requires the same
/// non-aliasing guarantee from the caller on every port.
unsafe fn leak_stack(stack: &'static [u8; 32 * 1024]) -> &'static mut [u8] {
    let ptr = stack.as_ptr() as *mut u8;
    std::slice::from_raw_parts_mut(ptr, stack.len())
}

#[test]
fn worker_task_runs_after_start() {
    let _ = env_logger::try_init();

    static KERNEL: once_cell::sync::OnceCell<std::sync::Mutex<TestKernel>> =
        once_cell::sync::OnceCell::new();
    KERNEL.set(std::sync::Mutex::new(TestKernel::new())).ok();
    let kernel = KERNEL.get().unwrap();

    fn user_init(k: &mut TestKernel) {
        let worker = unsafe { k.create_task(0, leak_stack(&WORKER_STACK), counting_task, 0) }
            .expect("create worker task");
        k.activate_task(worker).expect("activate worker task");
    }

    std::thread::spawn(move || {
        let mut guard = kernel.lock().unwrap();
        let k: &mut TestKernel = &mut guard;
        unsafe {
            k.start(leak_stack(&IDLE_STACK), user_init);
        }
    });

    let deadline = Instant::now() + Duration::from_secs(5);
    while TICKS_SEEN.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(
        TICKS_SEEN.load(Ordering::SeqCst) > 0,
        "worker task never ran within the deadline"
    );
}

#[test]
fn disable_restore_interrupts_round_trips() {
    let mask = StdPort::disable_interrupts();
    StdPort::restore_interrupts(mask);
}
