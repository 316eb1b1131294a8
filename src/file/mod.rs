//! Open-file table boundary.
//!
//! The file abstraction itself (pipes, device files, on-disk inodes) sits
//! on top of the file system, which is out of scope here. The core only
//! ever holds an opaque `*mut File` in a process's `ofile` table and asks
//! it to bump/drop its reference count via `filedup`/`fileclose`, both
//! named as consumed external interfaces.

use crate::param::NFILE;
use crate::spinlock::Spinlock;

pub struct File {
    pub ref_cnt: i32,
    pub readable: bool,
    pub writable: bool,
}

impl File {
    const fn zeroed() -> Self {
        File { ref_cnt: 0, readable: false, writable: false }
    }
}

struct FTable {
    lock: Spinlock,
    file: [File; NFILE],
}

static mut FTABLE: FTable = FTable {
    lock: Spinlock::new("ftable"),
    file: [const { File::zeroed() }; NFILE],
};

pub fn fileinit() {}

/// Increment `f`'s reference count, returning the same pointer.
pub fn filedup(f: *mut File) -> *mut File {
    unsafe {
        FTABLE.lock.acquire();
        if let Some(file) = f.as_mut() {
            if file.ref_cnt < 1 {
                panic!("filedup");
            }
            file.ref_cnt += 1;
        }
        FTABLE.lock.release();
    }
    f
}

/// Drop a reference to `f`, closing it (and releasing the underlying
/// pipe/inode) once the count reaches zero.
pub fn fileclose(f: *mut File) {
    unsafe {
        FTABLE.lock.acquire();
        let file = match f.as_mut() {
            Some(file) => file,
            None => {
                FTABLE.lock.release();
                return;
            }
        };
        if file.ref_cnt < 1 {
            panic!("fileclose");
        }
        file.ref_cnt -= 1;
        if file.ref_cnt > 0 {
            FTABLE.lock.release();
            return;
        }
        file.ref_cnt = 0;
        file.readable = false;
        file.writable = false;
        FTABLE.lock.release();
    }
}
