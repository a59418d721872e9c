use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Global readiness flag, set once the server has bootstrapped.
static READY: AtomicBool = AtomicBool::new(false);

/// Number of worker slots currently running a worker.
static WORKERS_RUNNING: AtomicUsize = AtomicUsize::new(0);

/// Mark the process as ready to accept batches.
pub fn mark_ready() {
    READY.store(true, Ordering::SeqCst);
    log::info!("Batch gateway bootstrapped, service is ready");
}

/// Check if the process is ready to handle traffic.
pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}

pub fn worker_started() {
    WORKERS_RUNNING.fetch_add(1, Ordering::SeqCst);
}

pub fn worker_stopped() {
    // saturating: a worker that never reached Running must not underflow
    let _ = WORKERS_RUNNING.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        Some(n.saturating_sub(1))
    });
}

pub fn workers_running() -> usize {
    WORKERS_RUNNING.load(Ordering::SeqCst)
}

#[cfg(test)]
pub(crate) fn reset() {
    READY.store(false, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

// READY is process-wide; tests that flip it hold this lock.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_not_ready() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        assert!(!is_ready());
    }

    #[test]
    fn test_mark_ready() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        reset();
        mark_ready();
        assert!(is_ready());
        mark_ready();
        assert!(is_ready());
    }
}
