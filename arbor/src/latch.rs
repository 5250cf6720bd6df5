//! Page latches as an explicit state machine.
//!
//! A latch moves between `Free`, `Shared`, `Update` and `Exclusive`. Every
//! transition is a guarded operation that reports whether it happened.
//! An update latch coexists with shared holders and can be upgraded to
//! exclusive once they leave; two update latches exclude each other.

use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::page::Page;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LatchMode {
    Shared,
    Update,
    Exclusive,
}

impl fmt::Display for LatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LatchMode::Shared => "S",
            LatchMode::Update => "U",
            LatchMode::Exclusive => "X",
        })
    }
}

enum LatchState {
    Free,
    Shared(ArcRwLockReadGuard<RawRwLock, Page>),
    Update(ArcRwLockUpgradableReadGuard<RawRwLock, Page>),
    Exclusive(ArcRwLockWriteGuard<RawRwLock, Page>),
}

pub struct Latch {
    lock: Arc<RwLock<Page>>,
    state: LatchState,
}

impl Latch {
    pub fn new(lock: Arc<RwLock<Page>>) -> Self {
        Self {
            lock,
            state: LatchState::Free,
        }
    }

    pub fn mode(&self) -> Option<LatchMode> {
        match self.state {
            LatchState::Free => None,
            LatchState::Shared(_) => Some(LatchMode::Shared),
            LatchState::Update(_) => Some(LatchMode::Update),
            LatchState::Exclusive(_) => Some(LatchMode::Exclusive),
        }
    }

    /// Blocks until the latch is granted. Only legal from `Free`.
    pub fn acquire(&mut self, mode: LatchMode) -> bool {
        if !matches!(self.state, LatchState::Free) {
            return false;
        }
        self.state = match mode {
            LatchMode::Shared => LatchState::Shared(self.lock.read_arc()),
            LatchMode::Update => LatchState::Update(self.lock.upgradable_read_arc()),
            LatchMode::Exclusive => LatchState::Exclusive(self.lock.write_arc()),
        };
        true
    }

    /// Like `acquire`, but gives up instead of waiting.
    pub fn try_acquire(&mut self, mode: LatchMode) -> bool {
        if !matches!(self.state, LatchState::Free) {
            return false;
        }
        let next = match mode {
            LatchMode::Shared => self.lock.try_read_arc().map(LatchState::Shared),
            LatchMode::Update => self.lock.try_upgradable_read_arc().map(LatchState::Update),
            LatchMode::Exclusive => self.lock.try_write_arc().map(LatchState::Exclusive),
        };
        match next {
            Some(state) => {
                self.state = state;
                true
            }
            None => false,
        }
    }

    /// Update to exclusive. Waits for shared holders to drain.
    pub fn upgrade(&mut self) -> bool {
        match std::mem::replace(&mut self.state, LatchState::Free) {
            LatchState::Update(guard) => {
                self.state = LatchState::Exclusive(ArcRwLockUpgradableReadGuard::upgrade(guard));
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// Exclusive or update to shared.
    pub fn downgrade(&mut self) -> bool {
        match std::mem::replace(&mut self.state, LatchState::Free) {
            LatchState::Exclusive(guard) => {
                self.state = LatchState::Shared(ArcRwLockWriteGuard::downgrade(guard));
                true
            }
            LatchState::Update(guard) => {
                self.state = LatchState::Shared(ArcRwLockUpgradableReadGuard::downgrade(guard));
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    pub fn release(&mut self) -> bool {
        !matches!(
            std::mem::replace(&mut self.state, LatchState::Free),
            LatchState::Free
        )
    }

    pub fn page(&self) -> Option<&Page> {
        match &self.state {
            LatchState::Free => None,
            LatchState::Shared(guard) => Some(&**guard),
            LatchState::Update(guard) => Some(&**guard),
            LatchState::Exclusive(guard) => Some(&**guard),
        }
    }

    pub fn page_mut(&mut self) -> Option<&mut Page> {
        match &mut self.state {
            LatchState::Exclusive(guard) => Some(&mut **guard),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_id::PageId;

    fn shared_page() -> Arc<RwLock<Page>> {
        Arc::new(RwLock::new(Page::new(PageId::new(0, 1))))
    }

    #[test]
    fn transitions_are_guarded() {
        let lock = shared_page();
        let mut latch = Latch::new(lock.clone());
        assert!(latch.page().is_none());
        assert!(!latch.upgrade());
        assert!(latch.acquire(LatchMode::Update));
        assert!(!latch.acquire(LatchMode::Shared));
        assert!(latch.upgrade());
        assert_eq!(latch.mode(), Some(LatchMode::Exclusive));
        latch.page_mut().unwrap().set_lsn(5);
        assert!(latch.downgrade());
        assert_eq!(latch.mode(), Some(LatchMode::Shared));
        assert!(latch.page_mut().is_none());
        assert_eq!(latch.page().unwrap().lsn(), 5);
        assert!(latch.release());
        assert!(!latch.release());
    }

    #[test]
    fn update_coexists_with_shared_only() {
        let lock = shared_page();
        let mut reader = Latch::new(lock.clone());
        let mut updater = Latch::new(lock.clone());
        let mut other = Latch::new(lock.clone());
        assert!(reader.acquire(LatchMode::Shared));
        assert!(updater.try_acquire(LatchMode::Update));
        assert!(!other.try_acquire(LatchMode::Update));
        assert!(!other.try_acquire(LatchMode::Exclusive));
        assert!(other.try_acquire(LatchMode::Shared));
        other.release();
        reader.release();
        assert!(updater.upgrade());
        assert!(!other.try_acquire(LatchMode::Shared));
    }
}
