//! # Titan Example Firmware (CM7)
//!
//! Brings the kernel up on the primary core with a producer and a consumer
//! sharing a counting semaphore and an event flag:
//!
//! | Thread | Priority | Stack | Behavior |
//! |--------|----------|-------|----------|
//! | `producer` | 4 | static | Releases one item every 10 ticks, waits for the drain flag after each batch |
//! | `consumer` | 6 | kernel heap | Acquires items, sets the drain flag once a batch is consumed |
//!
//! Both primitives are created `shared`, so a thread on the CM4 image may
//! use them as well. The host build of this binary does nothing.

#![cfg_attr(target_os = "none", no_std, no_main)]

#[cfg(all(target_arch = "arm", target_os = "none"))]
mod firmware {
    use core::ptr::{addr_of, addr_of_mut};

    use cortex_m_rt::entry;
    use panic_halt as _;

    use titan_kernel::fault::ThreadFault;
    use titan_kernel::{kernel, thread_mem_size, Flag, Semaphore, Stack, Thread, Timeout};

    const BATCH: u32 = 8;
    const PRODUCER_STACK: usize = 1024;
    const CONSUMER_STACK: usize = 1024;

    struct Link {
        items: Semaphore,
        drained: Flag,
    }

    static mut LINK: Link = Link {
        items: Semaphore::INVALID,
        drained: Flag::INVALID,
    };

    static mut PRODUCER_MEM: Stack<{ thread_mem_size(PRODUCER_STACK) }> = Stack::new();

    fn link(arg: usize) -> &'static Link {
        // Written once in `main` before the scheduler starts.
        unsafe { &*(arg as *const Link) }
    }

    extern "C" fn producer(arg: usize) {
        let link = link(arg);
        loop {
            for _ in 0..BATCH {
                if kernel::sleep(10).is_err() {
                    return;
                }
                if link.items.release().is_err() {
                    log::warn!("producer: consumer fell behind");
                }
            }
            if link.drained.wait(true, Timeout::ticks(1000)).is_err() {
                log::warn!("producer: batch not drained");
            }
            if let Err(e) = link.drained.clear() {
                log::warn!("producer: drain flag not cleared: {}", e);
            }
        }
    }

    extern "C" fn consumer(arg: usize) {
        let link = link(arg);
        let mut taken = 0u32;
        loop {
            match link.items.acquire(Timeout::FOREVER) {
                Ok(()) => taken += 1,
                Err(e) => {
                    log::error!("consumer: {:?}", e);
                    return;
                }
            }
            if taken % BATCH == 0 {
                log::info!("consumer: {} items", taken);
                if let Err(e) = link.drained.set() {
                    log::warn!("consumer: drain flag not set: {}", e);
                }
            }
        }
    }

    fn on_fault(thread: Thread, fault: ThreadFault) {
        log::error!("thread {} faulted: {:?}", thread.id(), fault);
    }

    #[entry]
    fn main() -> ! {
        kernel::init();
        kernel::set_fault_hook(Some(on_fault));

        let items = Semaphore::create(0, BATCH, true).expect("items semaphore");
        let drained = Flag::create(false, true).expect("drained flag");
        unsafe {
            LINK = Link { items, drained };
        }
        let arg = addr_of!(LINK) as usize;

        let producer_mem: &'static mut [u8] = unsafe { &mut *addr_of_mut!(PRODUCER_MEM.0) };
        kernel::create_thread(Some(producer_mem), producer, arg, PRODUCER_STACK, 4)
            .expect("producer thread");
        kernel::create_thread(None, consumer, arg, CONSUMER_STACK, 6).expect("consumer thread");

        kernel::start()
    }
}

#[cfg(not(all(target_arch = "arm", target_os = "none")))]
fn main() {}
