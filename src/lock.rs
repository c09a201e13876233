//
// lock.rs -- advisory whole-file locking
//
// This file is part of the gdbm-core software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use log::debug;

/// Which locking primitive ended up holding the lock; release must use
/// the same one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMechanism {
    Flock,
    Lockf,
    Fcntl,
}

/// What to do when the file is already locked by somebody else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockWait {
    /// Fail immediately.
    #[default]
    None,
    /// Poll at `interval` until `timeout` has elapsed.
    Retry { timeout: Duration, interval: Duration },
    /// Issue a blocking lock bounded by a SIGALRM timer.  This briefly
    /// replaces the process SIGALRM disposition; prefer `Retry` unless
    /// the process owns its signal handling.
    Signal { timeout: Duration },
}

/// Lock acquisition failure, distinct from ordinary I/O trouble so the
/// caller can report reader/writer contention.
#[derive(Debug)]
pub enum LockError {
    Contended,
    Io(io::Error),
}

enum TryLock {
    Acquired(LockMechanism),
    Contended,
    // mechanism unavailable here; fall through to the next one
    Next,
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn try_flock(fd: RawFd, exclusive: bool, nonblocking: bool) -> TryLock {
    let mut op = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    };
    if nonblocking {
        op |= libc::LOCK_NB;
    }

    if unsafe { libc::flock(fd, op) } == 0 {
        TryLock::Acquired(LockMechanism::Flock)
    } else {
        match last_errno() {
            libc::EWOULDBLOCK | libc::EINTR => TryLock::Contended,
            _ => TryLock::Next,
        }
    }
}

fn try_lockf(fd: RawFd, exclusive: bool, nonblocking: bool) -> TryLock {
    // lockf fails with EINVAL on descriptors without write permission,
    // so it can never serve readers
    if !exclusive {
        return TryLock::Next;
    }

    let cmd = if nonblocking {
        libc::F_TLOCK
    } else {
        libc::F_LOCK
    };
    if unsafe { libc::lockf(fd, cmd, 0) } == 0 {
        TryLock::Acquired(LockMechanism::Lockf)
    } else {
        match last_errno() {
            libc::EINTR | libc::EACCES | libc::EAGAIN | libc::EDEADLK => TryLock::Contended,
            _ => TryLock::Next,
        }
    }
}

fn try_fcntl(fd: RawFd, exclusive: bool, nonblocking: bool) -> TryLock {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = if exclusive {
        libc::F_WRLCK as libc::c_short
    } else {
        libc::F_RDLCK as libc::c_short
    };
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = 0;
    fl.l_len = 0;

    let cmd = if nonblocking {
        libc::F_SETLK
    } else {
        libc::F_SETLKW
    };
    if unsafe { libc::fcntl(fd, cmd, &fl) } == 0 {
        TryLock::Acquired(LockMechanism::Fcntl)
    } else {
        match last_errno() {
            libc::EINTR | libc::EACCES | libc::EAGAIN | libc::EDEADLK => TryLock::Contended,
            _ => TryLock::Next,
        }
    }
}

// Walk the chain of locking mechanisms, skipping ones the platform or
// descriptor cannot serve.
fn lock_once(fd: RawFd, exclusive: bool, nonblocking: bool) -> Result<LockMechanism, LockError> {
    let chain: [fn(RawFd, bool, bool) -> TryLock; 3] = [try_flock, try_lockf, try_fcntl];
    for attempt in chain {
        match attempt(fd, exclusive, nonblocking) {
            TryLock::Acquired(mechanism) => {
                debug!("file lock acquired via {mechanism:?} (exclusive={exclusive})");
                return Ok(mechanism);
            }
            TryLock::Contended => return Err(LockError::Contended),
            TryLock::Next => (),
        }
    }

    Err(LockError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "no usable file locking mechanism",
    )))
}

fn unlock(fd: RawFd, mechanism: LockMechanism) {
    unsafe {
        match mechanism {
            LockMechanism::Flock => {
                libc::flock(fd, libc::LOCK_UN);
            }
            LockMechanism::Lockf => {
                libc::lockf(fd, libc::F_ULOCK, 0);
            }
            LockMechanism::Fcntl => {
                let mut fl: libc::flock = std::mem::zeroed();
                fl.l_type = libc::F_UNLCK as libc::c_short;
                fl.l_whence = libc::SEEK_SET as libc::c_short;
                fl.l_start = 0;
                fl.l_len = 0;
                libc::fcntl(fd, libc::F_SETLK, &fl);
            }
        }
    }
}

extern "C" fn signull(_sig: libc::c_int) {
    // nothing: only here so the blocking lock call returns EINTR
}

// Blocking acquisition bounded by an interval timer.  The previous
// SIGALRM disposition and timer are restored before returning.
fn lock_with_alarm(
    fd: RawFd,
    exclusive: bool,
    timeout: Duration,
) -> Result<LockMechanism, LockError> {
    if timeout.is_zero() {
        return lock_once(fd, exclusive, true);
    }

    unsafe {
        let mut act: libc::sigaction = std::mem::zeroed();
        act.sa_sigaction = signull as extern "C" fn(libc::c_int) as usize;
        libc::sigemptyset(&mut act.sa_mask);
        act.sa_flags = 0;

        let mut oldact: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(libc::SIGALRM, &act, &mut oldact) != 0 {
            return Err(LockError::Io(io::Error::last_os_error()));
        }

        let mut itv: libc::itimerval = std::mem::zeroed();
        itv.it_value.tv_sec = timeout.as_secs() as libc::time_t;
        itv.it_value.tv_usec = timeout.subsec_micros() as libc::suseconds_t;
        let mut olditv: libc::itimerval = std::mem::zeroed();

        let result = if libc::setitimer(libc::ITIMER_REAL, &itv, &mut olditv) == 0 {
            let result = lock_once(fd, exclusive, false);
            libc::setitimer(libc::ITIMER_REAL, &olditv, std::ptr::null_mut());
            result
        } else {
            Err(LockError::Io(io::Error::last_os_error()))
        };

        libc::sigaction(libc::SIGALRM, &oldact, std::ptr::null_mut());

        result
    }
}

fn lock_with_retry(
    fd: RawFd,
    exclusive: bool,
    timeout: Duration,
    interval: Duration,
) -> Result<LockMechanism, LockError> {
    if timeout.is_zero() || interval.is_zero() {
        return lock_once(fd, exclusive, true);
    }

    let deadline = Instant::now() + timeout;
    loop {
        match lock_once(fd, exclusive, true) {
            Ok(mechanism) => return Ok(mechanism),
            Err(LockError::Contended) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(LockError::Contended);
                }
                std::thread::sleep(interval.min(deadline - now));
            }
            Err(e) => return Err(e),
        }
    }
}

/// A held advisory lock on the database file.  Released on drop using
/// the mechanism that acquired it.
#[derive(Debug)]
pub struct FileLock {
    fd: RawFd,
    mechanism: Option<LockMechanism>,
}

impl FileLock {
    pub fn acquire(file: &File, exclusive: bool, wait: LockWait) -> Result<FileLock, LockError> {
        let fd = file.as_raw_fd();
        let mechanism = match wait {
            LockWait::None => lock_once(fd, exclusive, true),
            LockWait::Retry { timeout, interval } => {
                lock_with_retry(fd, exclusive, timeout, interval)
            }
            LockWait::Signal { timeout } => lock_with_alarm(fd, exclusive, timeout),
        }?;

        Ok(FileLock {
            fd,
            mechanism: Some(mechanism),
        })
    }

    pub fn mechanism(&self) -> Option<LockMechanism> {
        self.mechanism
    }

    pub fn release(&mut self) {
        if let Some(mechanism) = self.mechanism.take() {
            unlock(self.fd, mechanism);
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;

    fn lockable_pair() -> (tempfile::TempDir, File, File) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockfile");
        std::fs::write(&path, b"x").unwrap();
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&path)
                .unwrap()
        };
        let (a, b) = (open(), open());
        (dir, a, b)
    }

    #[test]
    fn exclusive_excludes_exclusive() {
        let (_dir, a, b) = lockable_pair();
        let held = FileLock::acquire(&a, true, LockWait::None).unwrap();
        assert!(matches!(
            FileLock::acquire(&b, true, LockWait::None),
            Err(LockError::Contended)
        ));
        drop(held);
        assert!(FileLock::acquire(&b, true, LockWait::None).is_ok());
    }

    #[test]
    fn shared_locks_coexist() {
        let (_dir, a, b) = lockable_pair();
        let _ra = FileLock::acquire(&a, false, LockWait::None).unwrap();
        let _rb = FileLock::acquire(&b, false, LockWait::None).unwrap();
    }

    #[test]
    fn retry_waits_for_release() {
        let (_dir, a, b) = lockable_pair();
        let mut held = FileLock::acquire(&a, true, LockWait::None).unwrap();

        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            held.release();
        });

        let wait = LockWait::Retry {
            timeout: Duration::from_secs(3),
            interval: Duration::from_millis(50),
        };
        assert!(FileLock::acquire(&b, true, wait).is_ok());
        release.join().unwrap();
    }

    #[test]
    fn retry_times_out() {
        let (_dir, a, b) = lockable_pair();
        let _held = FileLock::acquire(&a, true, LockWait::None).unwrap();

        let wait = LockWait::Retry {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(50),
        };
        assert!(matches!(
            FileLock::acquire(&b, true, wait),
            Err(LockError::Contended)
        ));
    }
}
