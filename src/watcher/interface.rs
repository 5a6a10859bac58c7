//! Abstraction over the kernel readiness notification backends.
//!
//! Backends differ in how they report readiness. epoll is driven
//! edge-triggered so a descriptor reports once per transition to readable.
//! io_uring polls are one-shot and have to be armed again after a wakeup that
//! found no data, which is what [`AsPoller::rearm`] is for. Backends only ever
//! hand back raw descriptors; mapping those onto callbacks is the job of the
//! [`Watcher`](super::Watcher).
use std::{
    io,
    os::fd::{BorrowedFd, RawFd},
    time::Duration,
};

pub trait AsPoller {
    /// Start reporting readability of `fd`.
    fn add(&mut self, fd: BorrowedFd<'_>) -> io::Result<()>;

    /// Stop reporting `fd`. Must tolerate descriptors that are not registered.
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;

    /// Called after a wakeup for `fd` that left it registered.
    fn rearm(&mut self, fd: RawFd) -> io::Result<()>;

    /// Waits up to `timeout` (forever when `None`) and appends every ready
    /// descriptor to `ready`.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<RawFd>) -> io::Result<()>;
}
