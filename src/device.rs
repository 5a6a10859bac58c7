//! Single-reader handle over an evdev character device.
//!
//! A [`Device`] exclusively owns its descriptor. It is Open until a read
//! parks on the watcher (AwaitingReadiness) and Closed once terminated by
//! [`Device::close`], a fatal read error, or being dropped. Dropping a device
//! with a read in flight resumes that read with
//! [`DeviceError::Interrupted`] before the descriptor is released.
use std::{
    cell::RefCell,
    fmt,
    fs::OpenOptions,
    os::{
        fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
    rc::{Rc, Weak},
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    libc, unistd,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::DeviceError,
    read::{Get, Waiter},
    watcher::Watcher,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Open,
    AwaitingReadiness,
    Closed,
}

/// What [`Device::close`] does when a read is still in flight.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClosePolicy {
    /// Fail with [`DeviceError::Busy`]; the caller has to interrupt first.
    #[default]
    Refuse,
    /// Resume the pending read with [`DeviceError::Interrupted`], then close.
    Interrupt,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    pub close_policy: ClosePolicy,
}

pub(crate) struct Shared {
    pub(crate) fd: Option<OwnedFd>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) waiter: Option<Rc<Waiter>>,
    pub(crate) watcher: Watcher,
    pub(crate) label: String,
    options: DeviceOptions,
}

impl Shared {
    fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub(crate) fn is_waiting_on(&self, waiter: &Rc<Waiter>) -> bool {
        self.waiter.as_ref().is_some_and(|w| Rc::ptr_eq(w, waiter))
    }

    /// Drops the watcher registration and hands back the waiter, if any.
    /// The caller decides what the waiter is resumed with.
    pub(crate) fn end_wait(&mut self) -> Option<Rc<Waiter>> {
        let waiter = self.waiter.take()?;
        if let Some(fd) = self.raw_fd() {
            self.watcher.unregister(fd);
        }
        self.lifecycle = Lifecycle::Open;
        Some(waiter)
    }

    /// Releases the descriptor after a fatal read. Errors from `close(2)` are
    /// dropped: the handle is gone either way.
    pub(crate) fn terminate(&mut self) {
        debug_assert!(self.waiter.is_none());
        if self.fd.take().is_some() {
            tracing::debug!(device = %self.label, "device terminated");
        }
        self.lifecycle = Lifecycle::Closed;
    }

    fn is_consistent(&self) -> bool {
        let registered = self
            .raw_fd()
            .is_some_and(|fd| self.watcher.is_registered(fd));
        match self.lifecycle {
            Lifecycle::Open => self.fd.is_some() && self.waiter.is_none() && !registered,
            Lifecycle::AwaitingReadiness => self.waiter.is_some() && registered,
            Lifecycle::Closed => self.fd.is_none() && self.waiter.is_none(),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(waiter) = self.end_wait() {
            tracing::debug!(device = %self.label, "device dropped with a read in flight");
            waiter.resume(Err(DeviceError::Interrupted));
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL)?);
    if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    }
    Ok(())
}

fn interrupt(shared: &RefCell<Shared>) -> Result<(), DeviceError> {
    let mut dev = shared.borrow_mut();
    let waiter = dev.end_wait().ok_or(DeviceError::NotBusy)?;
    tracing::debug!(device = %dev.label, "interrupting read");
    drop(dev);
    waiter.resume(Err(DeviceError::Interrupted));
    Ok(())
}

pub struct Device {
    shared: Rc<RefCell<Shared>>,
}

impl Device {
    /// Opens `path` read-only and non-blocking.
    pub fn open(watcher: &Watcher, path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        Self::open_with(watcher, path, DeviceOptions::default())
    }

    pub fn open_with(
        watcher: &Watcher,
        path: impl AsRef<Path>,
        options: DeviceOptions,
    ) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(DeviceError::from_open)?;
        tracing::debug!(path = %path.display(), fd = file.as_raw_fd(), "opened device");

        Ok(Self::new(
            watcher,
            OwnedFd::from(file),
            path.display().to_string(),
            options,
        ))
    }

    /// Adopts an already open descriptor, switching it to non-blocking mode.
    ///
    /// Every successful `read(2)` on `fd` must return whole records, as evdev
    /// nodes do. A pipe qualifies only while its writer sends one record per
    /// `write(2)`; a short read trips the framing assertion in
    /// [`codec::decode`](crate::codec::decode).
    pub fn from_fd(
        watcher: &Watcher,
        fd: OwnedFd,
        options: DeviceOptions,
    ) -> Result<Self, DeviceError> {
        set_nonblocking(&fd)?;
        let label = format!("fd {}", fd.as_raw_fd());
        Ok(Self::new(watcher, fd, label, options))
    }

    fn new(watcher: &Watcher, fd: OwnedFd, label: String, options: DeviceOptions) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                fd: Some(fd),
                lifecycle: Lifecycle::Open,
                waiter: None,
                watcher: watcher.clone(),
                label,
                options,
            })),
        }
    }

    /// Reads the next record, parking the task while none is available.
    pub fn get(&self) -> Get {
        Get::new(Rc::downgrade(&self.shared))
    }

    /// Cancels the read in flight, resuming it with
    /// [`DeviceError::Interrupted`]. The device stays open.
    pub fn interrupt(&self) -> Result<(), DeviceError> {
        interrupt(&self.shared)
    }

    pub fn close(&self) -> Result<(), DeviceError> {
        let mut dev = self.shared.borrow_mut();
        if dev.fd.is_none() {
            return Err(DeviceError::AlreadyClosed);
        }

        let interrupted = match (dev.waiter.is_some(), dev.options.close_policy) {
            (false, _) => None,
            (true, ClosePolicy::Refuse) => return Err(DeviceError::Busy),
            (true, ClosePolicy::Interrupt) => dev.end_wait(),
        };

        let fd = dev.fd.take();
        dev.lifecycle = Lifecycle::Closed;
        let label = dev.label.clone();
        drop(dev);

        if let Some(waiter) = interrupted {
            waiter.resume(Err(DeviceError::Interrupted));
        }

        tracing::debug!(device = %label, "closing device");
        match fd {
            Some(fd) => unistd::close(fd.into_raw_fd()).map_err(|e| {
                tracing::warn!(device = %label, "close failed: {e}");
                DeviceError::from(e)
            }),
            None => Ok(()),
        }
    }

    /// A handle that can interrupt this device's reads without owning it.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter {
            shared: Rc::downgrade(&self.shared),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        let dev = self.shared.borrow();
        debug_assert!(dev.is_consistent());
        dev.lifecycle
    }

    pub fn is_busy(&self) -> bool {
        self.lifecycle() == Lifecycle::AwaitingReadiness
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        self.shared.borrow().raw_fd()
    }

    pub fn label(&self) -> String {
        self.shared.borrow().label.clone()
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dev = self.shared.borrow();
        f.debug_struct("Device")
            .field("label", &dev.label)
            .field("fd", &dev.raw_fd())
            .field("lifecycle", &dev.lifecycle)
            .finish()
    }
}

/// Weak interrupt handle, see [`Device::interrupter`].
#[derive(Clone)]
pub struct Interrupter {
    shared: Weak<RefCell<Shared>>,
}

impl Interrupter {
    /// Fails with [`DeviceError::Closed`] once the device has been dropped.
    pub fn interrupt(&self) -> Result<(), DeviceError> {
        let shared = self.shared.upgrade().ok_or(DeviceError::Closed)?;
        interrupt(&shared)
    }
}
