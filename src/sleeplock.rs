//! Long-term locks for processes: unlike a spinlock, a sleeplock may be
//! held across a blocking operation (e.g. disk I/O) because the holder
//! parks via [`crate::proc::sleep`] instead of spinning.

use crate::proc::{myproc, sleep, wakeup};
use crate::spinlock::Spinlock;

pub struct Sleeplock {
    locked: bool,
    lk: Spinlock,
    name: &'static str,
    pid: u32,
}

impl Sleeplock {
    pub const fn new(name: &'static str) -> Self {
        Sleeplock {
            locked: false,
            lk: Spinlock::new("sleep lock"),
            name,
            pid: 0,
        }
    }

    pub fn acquire(&mut self) {
        self.lk.acquire();
        while self.locked {
            sleep(self as *const Sleeplock as usize, &mut self.lk);
        }
        self.locked = true;
        self.pid = unsafe { (*myproc()).pid };
        self.lk.release();
    }

    pub fn release(&mut self) {
        self.lk.acquire();
        self.locked = false;
        self.pid = 0;
        wakeup(self as *const Sleeplock as usize);
        self.lk.release();
    }

    pub fn holding(&mut self) -> bool {
        self.lk.acquire();
        let r = self.locked && self.pid == unsafe { (*myproc()).pid };
        self.lk.release();
        r
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
