//! Scripted poller for tests: readiness is whatever the test fires.
use std::{
    cell::RefCell,
    collections::{HashSet, VecDeque},
    io,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    rc::Rc,
    time::Duration,
};

use super::AsPoller;

#[derive(Debug, Default)]
pub(crate) struct FakeStats {
    pub adds: usize,
    pub deletes: usize,
    pub rearms: usize,
    pub registered: HashSet<RawFd>,
    /// Number of upcoming `rearm` calls that fail.
    pub fail_rearms: usize,
    pending: VecDeque<RawFd>,
}

impl FakeStats {
    pub fn fire(&mut self, fd: RawFd) {
        self.pending.push_back(fd);
    }
}

pub(crate) struct FakePoller {
    stats: Rc<RefCell<FakeStats>>,
}

impl FakePoller {
    pub fn new() -> (Self, Rc<RefCell<FakeStats>>) {
        let stats = Rc::new(RefCell::new(FakeStats::default()));
        (
            Self {
                stats: stats.clone(),
            },
            stats,
        )
    }
}

impl AsPoller for FakePoller {
    fn add(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let mut stats = self.stats.borrow_mut();
        stats.adds += 1;
        stats.registered.insert(fd.as_raw_fd());
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        let mut stats = self.stats.borrow_mut();
        if stats.registered.remove(&fd) {
            stats.deletes += 1;
        }
        Ok(())
    }

    fn rearm(&mut self, _fd: RawFd) -> io::Result<()> {
        let mut stats = self.stats.borrow_mut();
        if stats.fail_rearms > 0 {
            stats.fail_rearms -= 1;
            return Err(io::Error::other("submission queue full"));
        }
        stats.rearms += 1;
        Ok(())
    }

    fn wait(&mut self, _timeout: Option<Duration>, ready: &mut Vec<RawFd>) -> io::Result<()> {
        ready.extend(self.stats.borrow_mut().pending.drain(..));
        Ok(())
    }
}
