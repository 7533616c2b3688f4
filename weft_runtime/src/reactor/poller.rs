//! epoll wrapper with an eventfd wake channel.

use std::io;
use std::os::unix::io::RawFd;

/// Readiness direction for a one-shot registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

impl Interest {
    fn epoll_events(self) -> u32 {
        let direction = match self {
            Interest::Read => libc::EPOLLIN,
            Interest::Write => libc::EPOLLOUT,
        };
        // One-shot keeps delivery at most-once per arm; RDHUP makes a peer
        // close surface as readiness so the waiter can observe EOF.
        (direction | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32
    }
}

pub(crate) struct Poller {
    epoll_fd: RawFd,
    wake_fd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Poller { epoll_fd, wake_fd })
    }

    /// Arm a one-shot registration for `fd`. Re-arming an fd that is already
    /// in the interest set is a modify, not an error.
    pub(crate) fn arm(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interest.epoll_events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) } == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness, up to `timeout_ms` (-1 blocks indefinitely).
    /// Returns the number of events written into `events`.
    pub(crate) fn wait(
        &self,
        events: &mut [libc::epoll_event],
        timeout_ms: i32,
    ) -> io::Result<usize> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr(),
                events.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    /// Force an in-flight `wait` to return.
    pub(crate) fn wake(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    pub(crate) fn is_wake_event(&self, fd: RawFd) -> bool {
        fd == self.wake_fd
    }

    pub(crate) fn drain_wake(&self) {
        let mut buf = 0u64;
        unsafe {
            libc::read(self.wake_fd, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn wake_interrupts_wait() {
        let poller = Poller::new().unwrap();
        poller.wake();
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = poller.wait(&mut events, 1_000).unwrap();
        assert_eq!(n, 1);
        let fd = events[0].u64 as RawFd;
        assert!(poller.is_wake_event(fd));
        poller.drain_wake();
    }

    #[test]
    fn one_shot_fires_once_per_arm() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe();
        poller.arm(read_fd, Interest::Read).unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = poller.wait(&mut events, 1_000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].u64 as RawFd, read_fd);

        // Still readable, but the registration is spent until re-armed.
        let n = poller.wait(&mut events, 50).unwrap();
        assert_eq!(n, 0);

        poller.arm(read_fd, Interest::Read).unwrap();
        let n = poller.wait(&mut events, 1_000).unwrap();
        assert_eq!(n, 1);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn arm_on_closed_fd_reports_error() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        assert!(poller.arm(read_fd, Interest::Read).is_err());
    }
}
