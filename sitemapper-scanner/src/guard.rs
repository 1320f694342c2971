use std::sync::atomic::{AtomicU8, Ordering};

const ARMED: u8 = 0;
const SPENT: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Armed,
    Spent,
}

/// Lets an operation run at most once for the lifetime of its owner.
///
/// `Armed -> Spent` is the only transition and it is taken atomically when
/// the operation is entered, so a concurrent second call never runs the body.
#[derive(Debug)]
pub struct RunOnceGuard {
    state: AtomicU8,
}

impl RunOnceGuard {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ARMED),
        }
    }

    pub fn state(&self) -> GuardState {
        match self.state.load(Ordering::Acquire) {
            ARMED => GuardState::Armed,
            _ => GuardState::Spent,
        }
    }

    /// Spend the guard. Returns `true` for exactly one caller.
    pub fn try_enter(&self) -> bool {
        self.state
            .compare_exchange(ARMED, SPENT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run `body` if the guard is still armed, `None` otherwise.
    pub async fn run<F: Future>(&self, body: F) -> Option<F::Output> {
        if !self.try_enter() {
            return None;
        }
        Some(body.await)
    }
}

impl Default for RunOnceGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_guard_spends_once() {
        let guard = RunOnceGuard::new();
        assert_eq!(guard.state(), GuardState::Armed);
        assert!(guard.try_enter());
        assert_eq!(guard.state(), GuardState::Spent);
        assert!(!guard.try_enter());
        assert!(!guard.try_enter());
        assert_eq!(guard.state(), GuardState::Spent);
    }

    #[test]
    fn test_concurrent_entry_has_one_winner() {
        let guard = Arc::new(RunOnceGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = guard.clone();
                let winners = winners.clone();
                std::thread::spawn(move || {
                    if guard.try_enter() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spent_before_body_runs() {
        let guard = Arc::new(RunOnceGuard::new());
        let inner = guard.clone();

        let result = guard
            .run(async move {
                // A re-entrant call from inside the body is already rejected
                inner.run(async { 2 }).await
            })
            .await;

        assert_eq!(result, Some(None));
        assert_eq!(guard.run(async { 3 }).await, None);
    }
}
