//! The read operation: a future that either completes straight away with a
//! record that was already queued, or parks its task until the watcher
//! reports the descriptor readable.
//!
//! Suspension happens in exactly one place ([`begin`] registering with the
//! watcher) and the parked task is resumed through its [`Waiter`] from one of
//! three places: the readiness callback, an interrupt, or the handle being
//! dropped.
use std::{
    cell::RefCell,
    future::Future,
    mem,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context, Poll, Waker},
};

use nix::{errno::Errno, unistd};

use crate::{
    codec::{self, Event, RECORD_SIZE},
    device::{Lifecycle, Shared},
    error::DeviceError,
    watcher::Watch,
};

pub(crate) enum Attempt {
    Ready(Event),
    WouldBlock,
    Closed,
    Failed(Errno),
}

/// One non-blocking read of a single record.
pub(crate) fn attempt(fd: &OwnedFd) -> Attempt {
    let mut buf = [0u8; RECORD_SIZE];
    loop {
        match unistd::read(fd.as_raw_fd(), &mut buf) {
            Ok(0) => return Attempt::Closed,
            Ok(n) => {
                tracing::trace!(fd = fd.as_raw_fd(), "read {n} bytes");
                return Attempt::Ready(codec::decode(&buf[..n]));
            }
            Err(Errno::EAGAIN) => return Attempt::WouldBlock,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECONNRESET | Errno::EPIPE) => return Attempt::Closed,
            Err(e) => return Attempt::Failed(e),
        }
    }
}

enum Slot {
    Waiting(Waker),
    Resumed(Result<Event, DeviceError>),
    Taken,
}

/// Resumption target of a suspended read.
pub(crate) struct Waiter {
    slot: RefCell<Slot>,
}

impl Waiter {
    fn new(waker: Waker) -> Rc<Self> {
        Rc::new(Self {
            slot: RefCell::new(Slot::Waiting(waker)),
        })
    }

    /// Hands `outcome` to the parked task and wakes it. Returns `false` when
    /// the waiter was already resumed, in which case `outcome` is dropped.
    pub(crate) fn resume(&self, outcome: Result<Event, DeviceError>) -> bool {
        let mut slot = self.slot.borrow_mut();
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Waiting(waker) => {
                *slot = Slot::Resumed(outcome);
                drop(slot);
                waker.wake();
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    pub(crate) fn is_resumed(&self) -> bool {
        !matches!(*self.slot.borrow(), Slot::Waiting(_))
    }

    fn poll(&self, cx: &mut Context<'_>) -> Poll<Result<Event, DeviceError>> {
        let mut slot = self.slot.borrow_mut();
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Waiting(mut waker) => {
                if !waker.will_wake(cx.waker()) {
                    waker = cx.waker().clone();
                }
                *slot = Slot::Waiting(waker);
                Poll::Pending
            }
            Slot::Resumed(outcome) => Poll::Ready(outcome),
            Slot::Taken => panic!("read result taken twice"),
        }
    }
}

pub(crate) enum Begin {
    Ready(Result<Event, DeviceError>),
    Suspended(Rc<Waiter>),
}

/// First poll of a read: either finishes immediately or parks on the watcher.
pub(crate) fn begin(shared: &Rc<RefCell<Shared>>, waker: &Waker) -> Begin {
    let mut dev = shared.borrow_mut();
    let Some(fd) = dev.fd.as_ref() else {
        return Begin::Ready(Err(DeviceError::Closed));
    };
    if dev.waiter.is_some() {
        return Begin::Ready(Err(DeviceError::Busy));
    }

    match attempt(fd) {
        Attempt::Ready(event) => Begin::Ready(Ok(event)),
        Attempt::WouldBlock => {
            let weak = Rc::downgrade(shared);
            let callback = Box::new(move || on_ready(&weak));
            if let Err(e) = dev.watcher.register(fd.as_fd(), callback) {
                return Begin::Ready(Err(DeviceError::Other(e.to_string())));
            }

            tracing::debug!(device = %dev.label, "yielding");
            let waiter = Waiter::new(waker.clone());
            dev.waiter = Some(waiter.clone());
            dev.lifecycle = Lifecycle::AwaitingReadiness;
            Begin::Suspended(waiter)
        }
        Attempt::Closed => {
            dev.terminate();
            Begin::Ready(Err(DeviceError::Closed))
        }
        Attempt::Failed(errno) => {
            dev.terminate();
            Begin::Ready(Err(errno.into()))
        }
    }
}

/// Readiness callback installed by [`begin`].
fn on_ready(shared: &Weak<RefCell<Shared>>) -> Watch {
    let Some(shared) = shared.upgrade() else {
        return Watch::Stop;
    };
    let mut dev = shared.borrow_mut();
    let Some(fd) = dev.fd.as_ref() else {
        return Watch::Stop;
    };
    if dev.waiter.is_none() {
        return Watch::Stop;
    }

    let outcome = match attempt(fd) {
        Attempt::WouldBlock => {
            tracing::trace!(device = %dev.label, "spurious wakeup");
            return Watch::Continue;
        }
        Attempt::Ready(event) => Ok(event),
        Attempt::Closed => Err(DeviceError::Closed),
        Attempt::Failed(errno) => Err(errno.into()),
    };

    let waiter = dev.end_wait();
    if outcome.is_err() {
        dev.terminate();
    }
    drop(dev);

    if let Some(waiter) = waiter {
        waiter.resume(outcome);
    }
    Watch::Stop
}

enum GetState {
    Idle,
    Suspended(Rc<Waiter>),
    Resumed,
}

/// Future returned by [`Device::get`](crate::Device::get).
///
/// Dropping it while suspended withdraws the read and leaves the device open.
#[must_use = "futures do nothing unless polled"]
pub struct Get {
    shared: Weak<RefCell<Shared>>,
    state: GetState,
}

impl Get {
    pub(crate) fn new(shared: Weak<RefCell<Shared>>) -> Self {
        Self {
            shared,
            state: GetState::Idle,
        }
    }
}

impl Future for Get {
    type Output = Result<Event, DeviceError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match &this.state {
            GetState::Idle => {
                let Some(shared) = this.shared.upgrade() else {
                    this.state = GetState::Resumed;
                    return Poll::Ready(Err(DeviceError::Closed));
                };
                match begin(&shared, cx.waker()) {
                    Begin::Ready(outcome) => {
                        this.state = GetState::Resumed;
                        Poll::Ready(outcome)
                    }
                    Begin::Suspended(waiter) => {
                        this.state = GetState::Suspended(waiter);
                        Poll::Pending
                    }
                }
            }
            GetState::Suspended(waiter) => {
                let poll = waiter.poll(cx);
                if poll.is_ready() {
                    this.state = GetState::Resumed;
                }
                poll
            }
            GetState::Resumed => panic!("`Get` polled after completion"),
        }
    }
}

impl Drop for Get {
    fn drop(&mut self) {
        let GetState::Suspended(waiter) = &self.state else {
            return;
        };
        if waiter.is_resumed() {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Ok(mut dev) = shared.try_borrow_mut() else {
            return;
        };
        if dev.is_waiting_on(waiter) {
            tracing::debug!(device = %dev.label, "pending read dropped");
            dev.end_wait();
        }
    }
}
