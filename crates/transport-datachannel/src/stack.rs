use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

const FINISH_ATTEMPTS: usize = 300;
const FINISH_BACKOFF: Duration = Duration::from_millis(10);

static GLOBAL_STACK: Lazy<Arc<TransportStack>> = Lazy::new(|| Arc::new(TransportStack::new()));

/// Process-wide registry guarding the transport library's global state.
/// Sessions acquire a guard on creation and release it on destruction; the
/// underlying state is initialized on the first acquire and torn down on the
/// last release, with teardown retried under bounded backoff while worker
/// loops still hold drain tickets. Injected into sessions rather than read
/// as an ambient global; `global()` is the shared default instance.
pub struct TransportStack {
    sessions: AtomicUsize,
    draining: AtomicUsize,
    state: Mutex<StackState>,
}

#[derive(Default)]
struct StackState {
    initialized: bool,
}

impl TransportStack {
    pub fn new() -> Self {
        Self {
            sessions: AtomicUsize::new(0),
            draining: AtomicUsize::new(0),
            state: Mutex::new(StackState::default()),
        }
    }

    pub fn global() -> Arc<TransportStack> {
        Arc::clone(&GLOBAL_STACK)
    }

    pub fn acquire(self: &Arc<Self>) -> StackGuard {
        if self.sessions.fetch_add(1, Ordering::AcqRel) == 0 {
            let mut state = self.state.lock();
            if !state.initialized {
                state.initialized = true;
                tracing::debug!(target = "datachannel::stack", "transport stack initialized");
            }
        }
        StackGuard {
            stack: Arc::clone(self),
        }
    }

    /// Taken by each worker loop for as long as it references shared
    /// transport resources; final teardown waits for every ticket.
    pub(crate) fn begin_drain(self: &Arc<Self>) -> DrainTicket {
        self.draining.fetch_add(1, Ordering::AcqRel);
        DrainTicket {
            stack: Arc::clone(self),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    fn release(&self) {
        if self.sessions.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        for _ in 0..FINISH_ATTEMPTS {
            if self.sessions.load(Ordering::Acquire) > 0 {
                // A newly created session owns the state now.
                return;
            }
            if self.draining.load(Ordering::Acquire) == 0 {
                let mut state = self.state.lock();
                if self.sessions.load(Ordering::Acquire) > 0 {
                    return;
                }
                state.initialized = false;
                tracing::debug!(target = "datachannel::stack", "transport stack torn down");
                return;
            }
            std::thread::sleep(FINISH_BACKOFF);
        }
        tracing::warn!(
            target = "datachannel::stack",
            "transport stack teardown gave up with worker loops still draining"
        );
    }
}

impl Default for TransportStack {
    fn default() -> Self {
        Self::new()
    }
}

/// One session's claim on the process-wide stack.
pub struct StackGuard {
    stack: Arc<TransportStack>,
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.stack.release();
    }
}

/// One worker loop's claim on shared transport resources during teardown.
pub(crate) struct DrainTicket {
    stack: Arc<TransportStack>,
}

impl Drop for DrainTicket {
    fn drop(&mut self) {
        self.stack.draining.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn initializes_on_first_acquire_and_tears_down_on_last_release() {
        let stack = Arc::new(TransportStack::new());
        assert!(!stack.is_initialized());

        let first = stack.acquire();
        let second = stack.acquire();
        assert!(stack.is_initialized());
        assert_eq!(stack.active_sessions(), 2);

        drop(first);
        assert!(stack.is_initialized());
        drop(second);
        assert!(!stack.is_initialized());
        assert_eq!(stack.active_sessions(), 0);
    }

    #[test]
    fn teardown_waits_for_drain_tickets() {
        let stack = Arc::new(TransportStack::new());
        let guard = stack.acquire();
        let ticket = stack.begin_drain();

        let releaser = {
            let stack = Arc::clone(&stack);
            thread::spawn(move || {
                drop(guard);
                stack.is_initialized()
            })
        };

        // Give the release a moment to start retrying, then let it finish.
        thread::sleep(Duration::from_millis(50));
        drop(ticket);
        let still_initialized_after_release = releaser.join().expect("join releaser");
        assert!(!still_initialized_after_release);
        assert!(!stack.is_initialized());
    }

    #[test]
    fn new_session_during_teardown_keeps_the_stack_alive() {
        let stack = Arc::new(TransportStack::new());
        let first = stack.acquire();
        let second = stack.acquire();
        drop(first);
        drop(second);
        assert!(!stack.is_initialized());

        let _third = stack.acquire();
        assert!(stack.is_initialized());
    }
}
