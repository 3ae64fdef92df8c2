//! Auto-reset events: a signal wakes exactly one wait.
use crate::deadline::Deadline;
use crate::handle::{Handle, HandleView, IoOperation, NativeHandle, PlatformHandle};
use crate::sender::Sender;
use crate::{Error, Result};

#[derive(Debug)]
pub struct EventHandle {
    platform: PlatformHandle,
}

impl EventHandle {
    /// A new event in the non-signaled state.
    pub fn new() -> Result<EventHandle> {
        let native = sys::create()?;
        Ok(EventHandle {
            platform: PlatformHandle::new(native, super::close_native),
        })
    }

    pub fn signal(&self) -> Result<()> {
        self.platform.block::<Signal>(())
    }

    /// Wait for the event to be signaled, consuming the signal.
    ///
    /// Fails with [`Error::TimedOut`] once the deadline expires.
    pub fn wait(&self, deadline: Deadline) -> Result<()> {
        self.platform.block::<Wait>(WaitParams { deadline })
    }

    pub fn wait_async(&self, deadline: Deadline) -> Sender<'_, Wait> {
        self.platform.sender(WaitParams { deadline })
    }
}

impl Handle for EventHandle {
    const NAME: &'static str = "event";

    fn platform(&self) -> &PlatformHandle {
        &self.platform
    }

    fn platform_mut(&mut self) -> &mut PlatformHandle {
        &mut self.platform
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WaitParams {
    pub deadline: Deadline,
}

#[derive(Debug)]
pub struct Wait;

impl IoOperation for Wait {
    type Handle = EventHandle;
    type Params = WaitParams;
    type Output = ();

    const INDEX: usize = 0;
    const NAME: &'static str = "wait";

    fn block(handle: &HandleView, params: WaitParams) -> Result<()> {
        sys::wait(handle.native, params.deadline.start())
    }
}

#[derive(Debug)]
pub struct Signal;

impl IoOperation for Signal {
    type Handle = EventHandle;
    type Params = ();
    type Output = ();

    const INDEX: usize = 1;
    const NAME: &'static str = "signal";
    const BOUNDED: bool = true;

    fn block(handle: &HandleView, _: ()) -> Result<()> {
        sys::signal(handle.native)
    }
}

#[cfg(unix)]
pub(crate) mod sys {
    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags};
    use nix::sys::eventfd::{eventfd, EfdFlags};

    use super::*;

    pub(crate) fn create() -> Result<NativeHandle> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(NativeHandle::new(fd))
    }

    pub(crate) fn signal(native: NativeHandle) -> Result<()> {
        loop {
            match nix::unistd::write(native.raw(), &1u64.to_ne_bytes()) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    /// Take the pending signal, if any, without blocking.
    pub(crate) fn consume(native: NativeHandle) -> Result<bool> {
        let mut value = [0u8; 8];
        loop {
            match nix::unistd::read(native.raw(), &mut value) {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    pub(crate) fn wait(native: NativeHandle, deadline: Deadline) -> Result<()> {
        loop {
            if consume(native)? {
                return Ok(());
            }
            let mut fds = [PollFd::new(native.raw(), PollFlags::POLLIN)];
            match poll(&mut fds, deadline.as_poll_timeout()) {
                Ok(0) => return Err(Error::TimedOut),
                Ok(_) | Err(Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        }
    }
}

#[cfg(windows)]
pub(crate) mod sys {
    use std::ptr;

    use winapi::shared::minwindef::FALSE;
    use winapi::shared::winerror::WAIT_TIMEOUT;
    use winapi::um::synchapi::{CreateEventW, SetEvent, WaitForSingleObject};
    use winapi::um::winbase::{INFINITE, WAIT_FAILED, WAIT_OBJECT_0};

    use super::*;

    pub(crate) fn create() -> Result<NativeHandle> {
        let event = unsafe { CreateEventW(ptr::null_mut(), FALSE, FALSE, ptr::null()) };
        if event.is_null() {
            return Err(Error::last_os_error());
        }
        Ok(NativeHandle::new(event as _))
    }

    pub(crate) fn signal(native: NativeHandle) -> Result<()> {
        if unsafe { SetEvent(native.raw() as _) } == 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn wait(native: NativeHandle, deadline: Deadline) -> Result<()> {
        let timeout = match deadline.as_poll_timeout() {
            -1 => INFINITE,
            millis => millis as u32,
        };
        match unsafe { WaitForSingleObject(native.raw() as _, timeout) } {
            WAIT_OBJECT_0 => Ok(()),
            WAIT_TIMEOUT => Err(Error::TimedOut),
            WAIT_FAILED => Err(Error::last_os_error()),
            _ => Err(Error::InvalidArgument),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::BlockingMultiplexer;
    use std::rc::Rc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_signal_then_wait() {
        let event = EventHandle::new().unwrap();
        event.signal().unwrap();
        event.wait(Deadline::Never).unwrap();
        // The signal was consumed.
        assert_eq!(Err(Error::TimedOut), event.wait(Deadline::Instant));
    }

    #[test]
    fn test_wait_times_out() {
        let mut event = EventHandle::new().unwrap();
        event.attach(Rc::new(BlockingMultiplexer::new())).unwrap();
        let started = Instant::now();
        assert_eq!(
            Err(Error::TimedOut),
            event.wait(Deadline::after(Duration::from_millis(20)))
        );
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
