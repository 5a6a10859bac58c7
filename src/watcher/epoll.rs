use nix::{
    errno::Errno,
    sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout},
};
use std::{
    io,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use super::AsPoller;

const EVENT_BUFFER_LEN: usize = 16;

pub struct EpollPoller {
    event_buffer: [EpollEvent; EVENT_BUFFER_LEN],
    epoll: Epoll,
}

impl EpollPoller {
    pub fn new() -> io::Result<Self> {
        let event_buffer = [EpollEvent::empty(); EVENT_BUFFER_LEN];
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

        Ok(Self {
            event_buffer,
            epoll,
        })
    }
}

impl AsPoller for EpollPoller {
    fn add(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        // Edge-triggered: one wakeup per transition to readable.
        let flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLET;
        self.epoll
            .add(fd, EpollEvent::new(flags, fd.as_raw_fd() as u64))?;
        Ok(())
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        // SAFETY: callers unregister before the descriptor is closed.
        let borrowed_fd = unsafe { BorrowedFd::borrow_raw(fd) };
        match self.epoll.delete(borrowed_fd) {
            Ok(()) | Err(Errno::ENOENT) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn rearm(&mut self, _fd: RawFd) -> io::Result<()> {
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<RawFd>) -> io::Result<()> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => {
                let millis = d.as_millis().min(u16::MAX as u128) as u16;
                EpollTimeout::from(millis)
            }
        };

        let num_fds = match self.epoll.wait(&mut self.event_buffer, timeout) {
            Ok(n) => n,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };

        ready.extend(
            self.event_buffer[..num_fds]
                .iter()
                .map(|event| event.data() as RawFd),
        );
        Ok(())
    }
}
