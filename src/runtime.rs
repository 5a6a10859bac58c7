//! Single-threaded cooperative executor that parks in the readiness watcher.
//!
//! Tasks are plain `!Send` futures kept on the runtime's thread. Wakers only
//! push task ids onto a ready queue, so waking is cheap and never re-enters a
//! task. When nothing is runnable the runtime blocks in
//! [`Watcher::turn`], whose callbacks wake the tasks parked on devices.
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    future::Future,
    io,
    pin::{pin, Pin},
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll, Wake, Waker},
};

use crate::watcher::Watcher;

type TaskId = u64;
type Task = Pin<Box<dyn Future<Output = ()>>>;

const MAIN_TASK: TaskId = u64::MAX;

#[derive(Default)]
struct ReadyQueue(Mutex<VecDeque<TaskId>>);

impl ReadyQueue {
    fn push(&self, id: TaskId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(id);
    }

    fn pop(&self) -> Option<TaskId> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

struct TaskWaker {
    id: TaskId,
    queue: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.queue.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.queue.push(self.id);
    }
}

pub struct Runtime {
    watcher: Watcher,
    tasks: RefCell<HashMap<TaskId, Task>>,
    next_id: Cell<TaskId>,
    queue: Arc<ReadyQueue>,
}

impl Runtime {
    /// Runtime over the platform's default readiness backend.
    #[cfg(target_os = "linux")]
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_watcher(Watcher::with_default_poller()?))
    }

    pub fn with_watcher(watcher: Watcher) -> Self {
        Self {
            watcher,
            tasks: RefCell::new(HashMap::new()),
            next_id: Cell::new(0),
            queue: Arc::new(ReadyQueue::default()),
        }
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.tasks.borrow_mut().insert(id, Box::pin(future));
        self.queue.push(id);
    }

    /// Drives `future` to completion, running spawned tasks alongside it.
    pub fn block_on<F: Future>(&self, future: F) -> io::Result<F::Output> {
        let mut future = pin!(future);
        let waker = self.waker(MAIN_TASK);
        self.queue.push(MAIN_TASK);

        loop {
            while let Some(id) = self.queue.pop() {
                if id != MAIN_TASK {
                    self.poll_task(id);
                    continue;
                }
                let mut cx = Context::from_waker(&waker);
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    return Ok(output);
                }
            }
            self.park()?;
        }
    }

    /// Runs until every spawned task has finished.
    pub fn run(&self) -> io::Result<()> {
        loop {
            while let Some(id) = self.queue.pop() {
                self.poll_task(id);
            }
            if self.tasks.borrow().is_empty() {
                return Ok(());
            }
            self.park()?;
        }
    }

    fn waker(&self, id: TaskId) -> Waker {
        Waker::from(Arc::new(TaskWaker {
            id,
            queue: self.queue.clone(),
        }))
    }

    fn poll_task(&self, id: TaskId) {
        // Taken out while polling so the task may spawn.
        let Some(mut task) = self.tasks.borrow_mut().remove(&id) else {
            return;
        };
        let waker = self.waker(id);
        let mut cx = Context::from_waker(&waker);
        if task.as_mut().poll(&mut cx).is_pending() {
            self.tasks.borrow_mut().insert(id, task);
        }
    }

    fn park(&self) -> io::Result<()> {
        if self.watcher.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "all tasks are parked and nothing is being watched",
            ));
        }
        let dispatched = self.watcher.turn(None)?;
        tracing::trace!(dispatched, "reactor turn");
        Ok(())
    }
}
