use io_uring::{
    opcode,
    types::{self, SubmitArgs, Timespec},
    IoUring,
};
use nix::{errno::Errno, libc};
use std::{
    collections::HashSet,
    io,
    os::fd::{AsRawFd, BorrowedFd, RawFd},
    time::Duration,
};

use super::AsPoller;

const IO_URING_ENTRIES: u32 = 32;

// Completions of cancellation requests carry this tag and are skipped.
const REMOVE_USER_DATA: u64 = u64::MAX;

pub struct IoUringPoller {
    ring: IoUring,
    armed: HashSet<RawFd>,
}

impl IoUringPoller {
    pub fn new() -> io::Result<Self> {
        let ring = IoUring::new(IO_URING_ENTRIES)?;
        Ok(Self {
            ring,
            armed: HashSet::new(),
        })
    }

    fn push_poll(&mut self, fd: RawFd) -> io::Result<()> {
        let entry = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as _)
            .build()
            .user_data(fd as u64);
        self.push(&entry)?;
        self.armed.insert(fd);
        Ok(())
    }

    fn push(&mut self, entry: &io_uring::squeue::Entry) -> io::Result<()> {
        // SAFETY: poll and poll-remove entries reference no user memory.
        if unsafe { self.ring.submission().push(entry) }.is_err() {
            self.ring.submit()?;
            unsafe { self.ring.submission().push(entry) }
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue is full"))?;
        }
        Ok(())
    }

    fn submit(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let res = match timeout {
            None => self.ring.submit_and_wait(1),
            Some(d) if d.is_zero() => self.ring.submit(),
            Some(d) => {
                let ts = Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
        };
        match res {
            Ok(_) => Ok(()),
            Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME) | Some(libc::EINTR)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl AsPoller for IoUringPoller {
    fn add(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        self.push_poll(fd.as_raw_fd())
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        if !self.armed.remove(&fd) {
            return Ok(());
        }
        let entry = opcode::PollRemove::new(fd as u64)
            .build()
            .user_data(REMOVE_USER_DATA);
        self.push(&entry)?;
        // Flush now so the cancellation lands before the descriptor is closed.
        self.ring.submit()?;
        Ok(())
    }

    fn rearm(&mut self, fd: RawFd) -> io::Result<()> {
        if self.armed.contains(&fd) {
            return Ok(());
        }
        self.push_poll(fd)
    }

    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<RawFd>) -> io::Result<()> {
        self.submit(timeout)?;

        for cqe in self.ring.completion() {
            let usr_data = cqe.user_data();
            if usr_data == REMOVE_USER_DATA {
                continue;
            }
            let fd = usr_data as RawFd;
            match cqe.result() {
                // A cancelled poll from an earlier registration of the same fd.
                x if x == -(Errno::ECANCELED as i32) => continue,
                x if x < 0 => {
                    tracing::warn!(fd, "poll failed: {}", Errno::from_raw(-x));
                    if self.armed.remove(&fd) {
                        ready.push(fd);
                    }
                }
                _ => {
                    // One-shot: the poll is consumed by its completion.
                    if self.armed.remove(&fd) {
                        ready.push(fd);
                    }
                }
            }
        }
        Ok(())
    }
}
