//! Readiness watcher: maps descriptors registered for readability onto the
//! callbacks that should run when the kernel reports them ready.
//!
//! The watcher never reads from a descriptor itself. A callback decides
//! whether it wants to keep watching by returning [`Watch`], and callbacks may
//! freely call [`Watcher::unregister`] (for their own descriptor too) while
//! being dispatched.
mod interface;
pub use interface::AsPoller;

#[cfg(test)]
pub(crate) mod fake;

#[cfg(all(feature = "io-uring", target_os = "linux"))]
mod io_uring;

#[cfg(all(feature = "io-uring", target_os = "linux"))]
pub use io_uring::IoUringPoller as Poller;

#[cfg(all(not(feature = "io-uring"), target_os = "linux"))]
mod epoll;

#[cfg(all(not(feature = "io-uring"), target_os = "linux"))]
pub use epoll::EpollPoller as Poller;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt, io,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    rc::Rc,
    time::Duration,
};

/// What a readiness callback wants after it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    Continue,
    Stop,
}

pub type Callback = Box<dyn FnMut() -> Watch>;

struct Dispatch {
    fd: RawFd,
    cancelled: bool,
}

struct Inner {
    poller: RefCell<Box<dyn AsPoller>>,
    callbacks: RefCell<HashMap<RawFd, Callback>>,
    dispatching: Cell<Option<Dispatch>>,
    ready: RefCell<Vec<RawFd>>,
    /// Descriptors whose re-arm failed. They are dispatched again on the next
    /// turn without waiting for the backend to report them.
    retry: RefCell<Vec<RawFd>>,
}

/// Cheaply clonable handle to a single-threaded readiness watcher.
#[derive(Clone)]
pub struct Watcher {
    inner: Rc<Inner>,
}

impl Watcher {
    pub fn new<P: AsPoller + 'static>(poller: P) -> Self {
        let poller: Box<dyn AsPoller> = Box::new(poller);
        Self {
            inner: Rc::new(Inner {
                poller: RefCell::new(poller),
                callbacks: RefCell::new(HashMap::new()),
                dispatching: Cell::new(None),
                ready: RefCell::new(Vec::new()),
                retry: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Watcher over the platform's default backend.
    #[cfg(target_os = "linux")]
    pub fn with_default_poller() -> io::Result<Self> {
        Ok(Self::new(Poller::new()?))
    }

    pub fn register(&self, fd: BorrowedFd<'_>, callback: Callback) -> io::Result<()> {
        let raw = fd.as_raw_fd();
        if self.is_registered(raw) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {raw} is already being watched"),
            ));
        }
        self.inner.poller.borrow_mut().add(fd)?;
        self.inner.callbacks.borrow_mut().insert(raw, callback);
        tracing::trace!(fd = raw, "watching");
        Ok(())
    }

    /// Removes `fd` from the watch set. A no-op when `fd` is not registered.
    pub fn unregister(&self, fd: RawFd) {
        let removed = self.inner.callbacks.borrow_mut().remove(&fd).is_some();
        let cancelled = self.cancel_dispatch(fd);
        self.inner.retry.borrow_mut().retain(|&r| r != fd);
        if !(removed || cancelled) {
            return;
        }
        if let Err(e) = self.inner.poller.borrow_mut().delete(fd) {
            tracing::warn!(fd, "failed to remove fd from poller: {e}");
        }
        tracing::trace!(fd, "unwatched");
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        if self.inner.callbacks.borrow().contains_key(&fd) {
            return true;
        }
        let current = self.inner.dispatching.take();
        let live = matches!(&current, Some(d) if d.fd == fd && !d.cancelled);
        self.inner.dispatching.set(current);
        live
    }

    pub fn len(&self) -> usize {
        let current = self.inner.dispatching.take();
        let extra = matches!(&current, Some(d) if !d.cancelled) as usize;
        self.inner.dispatching.set(current);
        self.inner.callbacks.borrow().len() + extra
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for readiness (forever when `timeout` is `None`) and runs the
    /// callbacks of every ready descriptor. Returns how many ran.
    ///
    /// A descriptor whose re-arm fails stays registered and is dispatched
    /// again on the following turn, which does not block.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut ready = self.inner.ready.take();
        ready.clear();
        let retry = self.inner.retry.take();
        let timeout = if retry.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };
        let res = self.inner.poller.borrow_mut().wait(timeout, &mut ready);
        if let Err(e) = res {
            self.inner.retry.replace(retry);
            self.inner.ready.replace(ready);
            return Err(e);
        }
        for fd in retry {
            if !ready.contains(&fd) {
                ready.push(fd);
            }
        }

        let mut dispatched = 0;
        for &fd in &ready {
            let Some(mut callback) = self.inner.callbacks.borrow_mut().remove(&fd) else {
                tracing::trace!(fd, "readiness for an fd no longer watched");
                continue;
            };

            self.inner.dispatching.set(Some(Dispatch {
                fd,
                cancelled: false,
            }));
            let watch = callback();
            dispatched += 1;
            let cancelled = self
                .inner
                .dispatching
                .take()
                .map_or(true, |d| d.cancelled);

            if cancelled {
                continue;
            }
            match watch {
                Watch::Continue => {
                    let mut callbacks = self.inner.callbacks.borrow_mut();
                    if callbacks.contains_key(&fd) {
                        // Re-registered from inside the callback; the new one wins.
                        continue;
                    }
                    callbacks.insert(fd, callback);
                    drop(callbacks);
                    if let Err(e) = self.inner.poller.borrow_mut().rearm(fd) {
                        tracing::warn!(fd, "failed to re-arm fd, retrying next turn: {e}");
                        self.inner.retry.borrow_mut().push(fd);
                    }
                }
                Watch::Stop => {
                    if let Err(e) = self.inner.poller.borrow_mut().delete(fd) {
                        tracing::warn!(fd, "failed to remove fd from poller: {e}");
                    }
                }
            }
        }

        self.inner.ready.replace(ready);
        Ok(dispatched)
    }

    fn cancel_dispatch(&self, fd: RawFd) -> bool {
        match self.inner.dispatching.take() {
            Some(d) if d.fd == fd && !d.cancelled => {
                self.inner.dispatching.set(Some(Dispatch {
                    fd,
                    cancelled: true,
                }));
                true
            }
            other => {
                self.inner.dispatching.set(other);
                false
            }
        }
    }
}

impl fmt::Debug for Watcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakePoller;
    use super::*;
    use nix::unistd::pipe;
    use std::os::fd::AsFd;

    #[test]
    fn double_register_is_rejected() {
        let (poller, _stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (rx, _tx) = pipe().unwrap();

        watcher
            .register(rx.as_fd(), Box::new(|| Watch::Continue))
            .unwrap();
        let err = watcher
            .register(rx.as_fd(), Box::new(|| Watch::Continue))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(watcher.len(), 1);
    }

    #[test]
    fn unregister_is_idempotent() {
        let (poller, stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        watcher.unregister(fd);
        assert_eq!(stats.borrow().deletes, 0);

        watcher
            .register(rx.as_fd(), Box::new(|| Watch::Continue))
            .unwrap();
        watcher.unregister(fd);
        watcher.unregister(fd);
        assert_eq!(stats.borrow().deletes, 1);
        assert!(watcher.is_empty());
    }

    #[test]
    fn continue_keeps_and_rearms() {
        let (poller, stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();
        let calls = Rc::new(Cell::new(0));

        let seen = calls.clone();
        watcher
            .register(
                rx.as_fd(),
                Box::new(move || {
                    seen.set(seen.get() + 1);
                    Watch::Continue
                }),
            )
            .unwrap();

        stats.borrow_mut().fire(fd);
        assert_eq!(watcher.turn(Some(Duration::ZERO)).unwrap(), 1);
        // Nothing fired, nothing dispatched.
        assert_eq!(watcher.turn(Some(Duration::ZERO)).unwrap(), 0);

        assert_eq!(calls.get(), 1);
        assert!(watcher.is_registered(fd));
        assert_eq!(stats.borrow().rearms, 1);
        assert_eq!(stats.borrow().deletes, 0);
    }

    #[test]
    fn stop_removes_registration() {
        let (poller, stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        watcher.register(rx.as_fd(), Box::new(|| Watch::Stop)).unwrap();
        stats.borrow_mut().fire(fd);
        watcher.turn(Some(Duration::ZERO)).unwrap();

        assert!(!watcher.is_registered(fd));
        assert_eq!(stats.borrow().deletes, 1);
    }

    #[test]
    fn callback_may_unregister_itself() {
        let (poller, stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        let handle = watcher.clone();
        watcher
            .register(
                rx.as_fd(),
                Box::new(move || {
                    assert!(handle.is_registered(fd));
                    handle.unregister(fd);
                    assert!(!handle.is_registered(fd));
                    Watch::Continue
                }),
            )
            .unwrap();

        stats.borrow_mut().fire(fd);
        watcher.turn(Some(Duration::ZERO)).unwrap();

        assert!(watcher.is_empty());
        assert_eq!(stats.borrow().deletes, 1);
        assert_eq!(stats.borrow().rearms, 0);
    }

    #[test]
    fn failed_rearm_keeps_dispatching_and_retries() {
        let (poller, stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (a, _ta) = pipe().unwrap();
        let (b, _tb) = pipe().unwrap();
        let (fd_a, fd_b) = (a.as_raw_fd(), b.as_raw_fd());
        let a_calls = Rc::new(Cell::new(0));
        let b_calls = Rc::new(Cell::new(0));

        let seen = a_calls.clone();
        watcher
            .register(
                a.as_fd(),
                Box::new(move || {
                    seen.set(seen.get() + 1);
                    Watch::Continue
                }),
            )
            .unwrap();
        let seen = b_calls.clone();
        watcher
            .register(
                b.as_fd(),
                Box::new(move || {
                    seen.set(seen.get() + 1);
                    Watch::Stop
                }),
            )
            .unwrap();

        stats.borrow_mut().fail_rearms = 1;
        stats.borrow_mut().fire(fd_a);
        stats.borrow_mut().fire(fd_b);
        assert_eq!(watcher.turn(Some(Duration::ZERO)).unwrap(), 2);

        assert_eq!(b_calls.get(), 1);
        assert!(!watcher.is_registered(fd_b));
        assert!(watcher.is_registered(fd_a));
        assert_eq!(stats.borrow().rearms, 0);

        // No fresh readiness report: the failed fd is dispatched again.
        assert_eq!(watcher.turn(None).unwrap(), 1);
        assert_eq!(a_calls.get(), 2);
        assert_eq!(stats.borrow().rearms, 1);
        assert_eq!(watcher.turn(Some(Duration::ZERO)).unwrap(), 0);
    }

    #[test]
    fn unregister_drops_pending_retry() {
        let (poller, stats) = FakePoller::new();
        let watcher = Watcher::new(poller);
        let (rx, _tx) = pipe().unwrap();
        let fd = rx.as_raw_fd();

        watcher
            .register(rx.as_fd(), Box::new(|| Watch::Continue))
            .unwrap();
        stats.borrow_mut().fail_rearms = 1;
        stats.borrow_mut().fire(fd);
        watcher.turn(Some(Duration::ZERO)).unwrap();

        watcher.unregister(fd);
        assert_eq!(watcher.turn(Some(Duration::ZERO)).unwrap(), 0);
    }
}
