//! Semaphore objects

use alloc::rc::Rc;
use core::cell::Cell;
use core::fmt;

use weft_syscall::{Code, Error, Result};

use crate::sched::{Event, Sched};

/// A counting semaphore with cooperative waiters.
pub struct SemObject {
    counter: Cell<u32>,
    waiters: Cell<i32>,
    event: Event,
}

impl SemObject {
    pub fn new(counter: u32, event: Event) -> Rc<Self> {
        Rc::new(Self {
            counter: Cell::new(counter),
            waiters: Cell::new(0),
            event,
        })
    }

    /// Decrement; blocks the calling handler while the counter is zero.
    /// Wakes with `RecvGone` if the semaphore is revoked beneath it.
    pub async fn down_async(sched: &Sched, sem: &Rc<Self>) -> Result<()> {
        while sem.counter.get() == 0 {
            sem.waiters.set(sem.waiters.get() + 1);
            sched.wait_for(sem.event).await;
            if sem.waiters.get() == -1 {
                return Err(Error::new(Code::RecvGone));
            }
            sem.waiters.set(sem.waiters.get() - 1);
        }
        sem.counter.set(sem.counter.get() - 1);
        Ok(())
    }

    /// Increment and wake waiters.
    pub fn up(&self, sched: &Sched) {
        if self.waiters.get() > 0 {
            sched.notify(self.event, None);
        }
        self.counter.set(self.counter.get() + 1);
    }

    /// Wake all waiters with "gone".
    pub fn revoke(&self, sched: &Sched) {
        if self.waiters.get() > 0 {
            sched.notify(self.event, None);
        }
        self.waiters.set(-1);
    }
}

impl fmt::Debug for SemObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Sem[counter={}, waiters={}]",
            self.counter.get(),
            self.waiters.get()
        )
    }
}
