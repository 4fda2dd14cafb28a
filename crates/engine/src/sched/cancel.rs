//! Hierarchical cancellation for async tickers.
//!
//! A [`CancelToken`] created with [`CancelToken::new`] is a group; tokens made
//! with [`CancelToken::child`] belong to it. Cancelling a group cancels every
//! member at once: from the moment the group's flag is set no member can
//! [`enter`](CancelToken::enter) a new iteration. Cancelling a single member
//! leaves its siblings running.
//!
//! Work done inside an entered section is shielded: [`CancelToken::cancel`]
//! waits for every section in flight on the token (or its members) to finish
//! before returning, so once it returns no further work starts or runs.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::sync::watch;

struct CancelState {
    cancelled: AtomicBool,
    /// Held shared by entered sections, exclusively by `cancel` to drain them.
    gate: RwLock<()>,
    signal: watch::Sender<bool>,
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl CancelState {
    fn new(cancelled: bool) -> Arc<Self> {
        let (signal, _) = watch::channel(cancelled);
        Arc::new(Self {
            cancelled: AtomicBool::new(cancelled),
            gate: RwLock::new(()),
            signal,
            children: Mutex::new(Vec::new()),
        })
    }

    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        // A section entered on this thread cannot be waited for.
        if !entered_here(self.key()) {
            drop(self.gate.write());
        }
        self.signal.send_replace(true);

        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

thread_local! {
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn entered_here(key: usize) -> bool {
    ENTERED.with(|e| e.borrow().contains(&key))
}

/// Cancellation handle. Cloning shares the same token.
#[derive(Clone)]
pub struct CancelToken {
    /// Ancestors first, this token's own state last.
    chain: Vec<Arc<CancelState>>,
}

impl CancelToken {
    /// A new root token (group).
    pub fn new() -> Self {
        Self {
            chain: vec![CancelState::new(false)],
        }
    }

    fn own(&self) -> &Arc<CancelState> {
        self.chain.last().expect("token chain is never empty")
    }

    /// A member of this token's group. Created already cancelled if this
    /// token is cancelled.
    pub fn child(&self) -> Self {
        let own = self.own();
        let mut children = own.children.lock();
        let parent_cancelled = own.cancelled.load(Ordering::Acquire);
        let state = CancelState::new(parent_cancelled);
        if !parent_cancelled {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&state));
        }
        drop(children);

        let mut chain = self.chain.clone();
        chain.push(state);
        Self { chain }
    }

    /// Cancel this token and all of its members, waiting for sections in
    /// flight to complete.
    pub fn cancel(&self) {
        self.own().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|s| s.cancelled.load(Ordering::Acquire))
    }

    /// Begin a shielded section, or `None` if cancelled. Cancellation of this
    /// token or any ancestor waits until the returned guard is dropped.
    ///
    /// The guard must not be held across an `.await`.
    pub fn enter(&self) -> Option<Entered<'_>> {
        let mut guards = Vec::with_capacity(self.chain.len());
        for state in &self.chain {
            let guard = state.gate.read();
            if state.cancelled.load(Ordering::Acquire) {
                return None;
            }
            guards.push(guard);
        }
        let keys: Vec<usize> = self.chain.iter().map(CancelState::key).collect();
        ENTERED.with(|e| e.borrow_mut().extend_from_slice(&keys));
        Some(Entered {
            _guards: guards,
            keys,
        })
    }

    /// Resolves once this token (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.own().signal.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// An entered, non-cancellable section. See [`CancelToken::enter`].
pub struct Entered<'a> {
    _guards: Vec<RwLockReadGuard<'a, ()>>,
    keys: Vec<usize>,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        ENTERED.with(|e| {
            let mut entered = e.borrow_mut();
            for key in &self.keys {
                if let Some(i) = entered.iter().rposition(|k| k == key) {
                    entered.swap_remove(i);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn group_cancel_reaches_members() {
        let group = CancelToken::new();
        let a = group.child();
        let b = group.child();
        assert!(a.enter().is_some());

        group.cancel();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(a.enter().is_none());
        assert!(b.enter().is_none());
        assert!(group.child().is_cancelled());
    }

    #[test]
    fn member_cancel_leaves_siblings() {
        let group = CancelToken::new();
        let a = group.child();
        let b = group.child();
        a.cancel();
        assert!(a.enter().is_none());
        assert!(b.enter().is_some());
        assert!(!group.is_cancelled());
    }

    #[test]
    fn cancel_waits_for_entered_section() {
        let group = CancelToken::new();
        let member = group.child();
        let finished = Arc::new(AtomicBool::new(false));

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = {
            let finished = Arc::clone(&finished);
            std::thread::spawn(move || {
                let _entered = member.enter().unwrap();
                tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            })
        };

        rx.recv().unwrap();
        group.cancel();
        assert!(finished.load(Ordering::SeqCst));
        worker.join().unwrap();
    }

    #[test]
    fn cancel_from_inside_section_does_not_deadlock() {
        let token = CancelToken::new().child();
        let entered = token.enter().unwrap();
        token.cancel();
        drop(entered);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_future_wakes() {
        let group = CancelToken::new();
        let member = group.child();
        let waiter = tokio::spawn(async move { member.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        group.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("member woke")
            .unwrap();
    }
}
