use once_cell::sync::Lazy;
use parking_lot::Mutex;

type Cleanup = Box<dyn FnOnce() + Send + 'static>;

/// Global cleanup registry: store cleanup closures and run them when requested.
#[derive(Default)]
struct CleanupRegistry {
    items: Vec<Cleanup>,
}

impl CleanupRegistry {
    fn register(&mut self, f: Cleanup) {
        self.items.push(f);
    }

    fn take_all(&mut self) -> Vec<Cleanup> {
        std::mem::take(&mut self.items)
    }
}

static GLOBAL_CLEANUP: Lazy<Mutex<CleanupRegistry>> =
    Lazy::new(|| Mutex::new(CleanupRegistry::default()));

/// Register a cleanup closure to be run when `run_cleanups` is invoked.
pub fn register_cleanup(f: impl FnOnce() + Send + 'static) {
    GLOBAL_CLEANUP.lock().register(Box::new(f));
}

/// Run all registered cleanup closures. Safe to call multiple times.
pub fn run_cleanups() {
    // Release the lock before running, a cleanup may register another.
    let items = GLOBAL_CLEANUP.lock().take_all();
    log::debug!("Running {} cleanup handlers", items.len());
    for f in items {
        // Each cleanup gets its own catch_unwind to avoid aborting others
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
            log::warn!("A cleanup handler panicked");
        }
    }
}
