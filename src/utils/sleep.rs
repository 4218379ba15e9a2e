//! Sleep utilities

use std::time::Duration;

/// Block the calling thread for `ms` milliseconds; 0 returns at once.
pub fn sleep_ms(ms: u64) {
    if ms > 0 {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
