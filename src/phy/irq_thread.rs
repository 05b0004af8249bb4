use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Emulated interrupt context for platforms without real interrupts.
///
/// Runs on its own thread and repeatedly reads the clock, then calls every handler with the
/// current time.  Handlers are expected to call the driver's interrupt entry points, which return
/// immediately when nothing is pending.
///
/// The thread is stopped and joined on drop.
#[derive(Debug)]
pub struct InterruptThread {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

pub type InterruptHandler = Box<dyn FnMut(crate::time::Instant) + Send>;

impl InterruptThread {
    pub fn spawn<C>(mut clock: C, mut handlers: Vec<InterruptHandler>) -> Self
    where
        C: FnMut() -> crate::time::Instant + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let handle = std::thread::Builder::new()
            .name("dmx-irq".into())
            .spawn(move || {
                log::trace!("Interrupt thread started with {} handlers", handlers.len());
                while !stop2.load(Ordering::Acquire) {
                    let now = clock();
                    for handler in handlers.iter_mut() {
                        handler(now);
                    }
                    std::thread::yield_now();
                }
                log::trace!("Interrupt thread stopped");
            })
            .expect("failed spawning interrupt thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop_inner();
    }

    fn stop_inner(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Interrupt thread panicked");
            }
        }
    }
}

impl Drop for InterruptThread {
    fn drop(&mut self) {
        self.stop_inner();
    }
}
