//! Shutdown on signals delivered through a `signalfd`.
//!
//! The signals are blocked on the calling thread so they are never delivered
//! asynchronously; instead the signalfd becomes readable and is handled by the
//! same watcher that drives the devices. On delivery every device handed to
//! [`Shutdown::watch`] has its pending read interrupted.
use nix::sys::{
    signal::{SigSet, Signal},
    signalfd::{SfdFlags, SignalFd},
};
use std::{
    cell::{Cell, RefCell},
    io,
    os::fd::{AsFd, AsRawFd},
    rc::Rc,
};

use crate::{
    device::Interrupter,
    error::DeviceError,
    watcher::{Watch, Watcher},
};

struct Inner {
    signal_fd: RefCell<SignalFd>,
    triggered: Cell<bool>,
    interrupters: RefCell<Vec<Interrupter>>,
}

impl Inner {
    fn on_readable(&self) -> Watch {
        loop {
            let res = self.signal_fd.borrow_mut().read_signal();
            match res {
                Ok(Some(info)) => {
                    match Signal::try_from(info.ssi_signo as i32) {
                        Ok(sig) => tracing::info!("received {sig}, shutting down"),
                        Err(_) => tracing::info!(signo = info.ssi_signo, "received signal"),
                    }
                    self.trigger();
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("failed to read signalfd: {e}");
                    break;
                }
            }
        }
        Watch::Continue
    }

    fn trigger(&self) {
        self.triggered.set(true);
        let interrupters = self.interrupters.borrow().clone();
        for interrupter in interrupters {
            match interrupter.interrupt() {
                Ok(()) | Err(DeviceError::NotBusy) | Err(DeviceError::Closed) => {}
                Err(e) => tracing::warn!("failed to interrupt device: {e}"),
            }
        }
    }
}

pub struct Shutdown {
    inner: Rc<Inner>,
    watcher: Watcher,
}

impl Shutdown {
    /// Blocks `signals` on this thread and starts watching for them.
    pub fn install(watcher: &Watcher, signals: &[Signal]) -> io::Result<Self> {
        let mut mask = SigSet::empty();
        for &sig in signals {
            mask.add(sig);
        }
        mask.thread_block()?;

        let signal_fd =
            SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        let inner = Rc::new(Inner {
            signal_fd: RefCell::new(signal_fd),
            triggered: Cell::new(false),
            interrupters: RefCell::new(Vec::new()),
        });

        let weak = Rc::downgrade(&inner);
        watcher.register(
            inner.signal_fd.borrow().as_fd(),
            Box::new(move || weak.upgrade().map_or(Watch::Stop, |inner| inner.on_readable())),
        )?;

        Ok(Self {
            inner,
            watcher: watcher.clone(),
        })
    }

    pub fn watch(&self, interrupter: Interrupter) {
        self.inner.interrupters.borrow_mut().push(interrupter);
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.get()
    }

    /// Same as receiving one of the watched signals.
    pub fn trigger(&self) {
        self.inner.trigger();
    }
}

impl Drop for Shutdown {
    fn drop(&mut self) {
        let fd = self.inner.signal_fd.borrow().as_raw_fd();
        self.watcher.unregister(fd);
    }
}
