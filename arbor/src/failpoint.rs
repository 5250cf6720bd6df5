//! Failure injection for crash and error-path tests.
//!
//! A point fires when it is armed on the current thread, or when its name is
//! listed in the comma-separated `ARBOR_FAILPOINTS` environment variable.
//! An armed point can let a number of checks pass before it fires, which
//! puts the failure in the middle of a multi-step operation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;

pub const FAILPOINTS_ENV: &str = "ARBOR_FAILPOINTS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Failpoint {
    /// The log flush, before anything reaches the disk.
    WalFlush,
    /// An overflow chunk write, before its page is touched.
    BlobWrite,
    /// Writing a dirty page out of the buffer pool.
    PageWrite,
}

impl Failpoint {
    pub const ALL: [Failpoint; 3] = [Failpoint::WalFlush, Failpoint::BlobWrite, Failpoint::PageWrite];

    pub fn name(self) -> &'static str {
        match self {
            Failpoint::WalFlush => "wal.flush",
            Failpoint::BlobWrite => "blob.write",
            Failpoint::PageWrite => "buffer.page_write",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|point| point.name() == name)
    }
}

thread_local! {
    /// Armed points and the number of checks each still lets pass.
    static ARMED: RefCell<HashMap<Failpoint, u32>> = RefCell::new(HashMap::new());
}

pub fn arm(point: Failpoint) {
    arm_after(point, 0);
}

/// Arms `point` so that it fires on the check after the next `passes` ones.
pub fn arm_after(point: Failpoint, passes: u32) {
    ARMED.with(|armed| {
        armed.borrow_mut().insert(point, passes);
    });
}

pub fn disarm(point: Failpoint) {
    ARMED.with(|armed| {
        armed.borrow_mut().remove(&point);
    });
}

pub fn disarm_all() {
    ARMED.with(|armed| armed.borrow_mut().clear());
}

fn listed(raw: &str, point: Failpoint) -> bool {
    raw.split(',').any(|name| name.trim() == point.name())
}

fn fires(point: Failpoint) -> bool {
    let armed = ARMED.with(|armed| match armed.borrow_mut().get_mut(&point) {
        Some(0) => true,
        Some(passes) => {
            *passes -= 1;
            false
        }
        None => false,
    });
    armed || std::env::var(FAILPOINTS_ENV).is_ok_and(|raw| listed(&raw, point))
}

/// Returns an I/O error when `point` fires.
pub fn check(point: Failpoint) -> io::Result<()> {
    if fires(point) {
        return Err(io::Error::other(format!("failpoint {} fired", point.name())));
    }
    Ok(())
}

/// Keeps a point armed on this thread until dropped.
#[must_use = "the failpoint is disarmed when the guard is dropped"]
pub struct FailpointGuard {
    point: Failpoint,
}

impl FailpointGuard {
    pub fn new(point: Failpoint) -> Self {
        Self::after(point, 0)
    }

    pub fn after(point: Failpoint, passes: u32) -> Self {
        arm_after(point, passes);
        Self { point }
    }
}

impl Drop for FailpointGuard {
    fn drop(&mut self) {
        disarm(self.point);
    }
}
