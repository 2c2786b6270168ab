// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic timers backed by Linux `timerfd`.
//!
//! A timer is a non-blocking descriptor registered with the reactor's poll.
//! Each readiness event is consumed by reading the 8-byte expiration count
//! the kernel accumulated since the previous read.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use mio::event::Source;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};

/// Handle to a reactor-owned timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) usize);

impl TimerId {
    /// Position of the timer in creation order.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Periodic `CLOCK_MONOTONIC` timer.
#[derive(Debug)]
pub(crate) struct Timer {
    file: File,
    name: String,
    interval: Duration,
}

impl Timer {
    /// Create and arm a timer firing every `interval`.
    pub(crate) fn new(name: &str, interval: Duration) -> io::Result<Self> {
        if interval.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer interval must be non-zero",
            ));
        }

        // SAFETY:
        // - timerfd_create takes no pointers; both flags are valid for CLOCK_MONOTONIC
        // - Returns a new fd or -1 on error (checked below)
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY:
        // - fd was just returned by timerfd_create and is owned by nobody else
        // - OwnedFd closes it exactly once on drop, including on the error path below
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let period = timespec(interval);
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };

        // SAFETY:
        // - fd is a valid timerfd owned by `fd`
        // - spec is a fully initialized itimerspec living on the stack for the call
        // - A null old_value pointer is allowed and means "don't report"
        let ret = unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            file: File::from(fd),
            name: name.to_string(),
            interval,
        })
    }

    /// Consume pending expirations.
    ///
    /// Returns `WouldBlock` when the event was spurious.
    pub(crate) fn read_expirations(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let n = (&self.file).read(&mut buf)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short timerfd read ({} bytes)", n),
            ));
        }
        Ok(u64::from_ne_bytes(buf))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn interval(&self) -> Duration {
        self.interval
    }
}

fn timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}

impl Source for Timer {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        SourceFd(&self.file.as_raw_fd()).deregister(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_rejected() {
        let err = Timer::new("zero", Duration::ZERO).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_read_before_expiry_would_block() {
        let timer = Timer::new("slow", Duration::from_secs(60)).unwrap();
        let err = timer.read_expirations().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(timer.name(), "slow");
        assert_eq!(timer.interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_expirations_accumulate() {
        let timer = Timer::new("fast", Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let fired = timer.read_expirations().unwrap();
        assert!(fired >= 2, "expected several expirations, got {}", fired);
    }
}
