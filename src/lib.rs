//! Asynchronous single-reader access to Linux evdev input devices.
//!
//! A [`Device`] wraps a non-blocking descriptor and hands out one decoded
//! [`Event`] per [`Device::get`]. While no record is queued the read parks on
//! the [`Watcher`], which the single-threaded [`Runtime`] turns whenever no
//! task can make progress.
//!
//! ```no_run
//! use evaio::{Device, Runtime};
//!
//! let rt = Runtime::new()?;
//! let device = Device::open(rt.watcher(), "/dev/input/event0")?;
//! let event = rt.block_on(device.get())??;
//! println!("{event}");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod cli;
pub mod codec;
pub mod conf;
pub mod consumer;
pub mod device;
pub mod error;
mod read;
pub mod runtime;
pub mod signals;
pub mod watcher;

pub use codec::Event;
pub use device::{ClosePolicy, Device, DeviceOptions, Interrupter, Lifecycle};
pub use error::{ConfigError, DeviceError};
pub use read::Get;
pub use runtime::Runtime;
pub use signals::Shutdown;
pub use watcher::{Watch, Watcher};
