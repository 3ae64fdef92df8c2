use std::any::Any;

use log::{debug, warn};

use crate::deadline::Deadline;
use crate::handle::HandleType;
use crate::multiplexer::{BlockingMultiplexer, HandleRelation, Multiplexer, PumpMode, PumpStatistics};
use crate::Result;

#[cfg(windows)]
use crate::iocp::{IocpMultiplexer, IocpOptions};
#[cfg(target_os = "linux")]
use crate::io_uring::{IoUringMultiplexer, IoUringOptions};

/// One of the multiplexers available on this platform.
pub enum AnyMultiplexer {
    Blocking(BlockingMultiplexer),
    #[cfg(target_os = "linux")]
    IoUring(IoUringMultiplexer),
    #[cfg(windows)]
    Iocp(IocpMultiplexer),
}

impl AnyMultiplexer {
    /// The best multiplexer the running system supports, with default options.
    ///
    /// Falls back to the blocking multiplexer if the kernel mechanism is unavailable.
    pub fn create() -> Result<AnyMultiplexer> {
        #[cfg(target_os = "linux")]
        {
            if crate::io_uring::is_supported() {
                match IoUringMultiplexer::new(&IoUringOptions::default()) {
                    Ok(multiplexer) => return Ok(AnyMultiplexer::IoUring(multiplexer)),
                    Err(err) => warn!("io_uring is supported but creation failed: {}", err),
                }
            }
        }
        #[cfg(windows)]
        {
            match IocpMultiplexer::new(&IocpOptions::default()) {
                Ok(multiplexer) => return Ok(AnyMultiplexer::Iocp(multiplexer)),
                Err(err) => warn!("completion port creation failed: {}", err),
            }
        }
        debug!("using the blocking multiplexer");
        Ok(AnyMultiplexer::Blocking(BlockingMultiplexer::new()))
    }

    fn inner(&self) -> &dyn Multiplexer {
        match self {
            AnyMultiplexer::Blocking(m) => m,
            #[cfg(target_os = "linux")]
            AnyMultiplexer::IoUring(m) => m,
            #[cfg(windows)]
            AnyMultiplexer::Iocp(m) => m,
        }
    }
}

impl From<BlockingMultiplexer> for AnyMultiplexer {
    fn from(multiplexer: BlockingMultiplexer) -> Self {
        AnyMultiplexer::Blocking(multiplexer)
    }
}

#[cfg(target_os = "linux")]
impl From<IoUringMultiplexer> for AnyMultiplexer {
    fn from(multiplexer: IoUringMultiplexer) -> Self {
        AnyMultiplexer::IoUring(multiplexer)
    }
}

#[cfg(windows)]
impl From<IocpMultiplexer> for AnyMultiplexer {
    fn from(multiplexer: IocpMultiplexer) -> Self {
        AnyMultiplexer::Iocp(multiplexer)
    }
}

// Descriptor functions downcast `as_any` to the concrete backend, so every provided method is
// left to the defaults operating on the inner multiplexer.
impl Multiplexer for AnyMultiplexer {
    fn name(&self) -> &'static str {
        self.inner().name()
    }

    fn as_any(&self) -> &dyn Any {
        self.inner().as_any()
    }

    fn find_handle_relation(&self, handle: HandleType) -> Result<&'static HandleRelation> {
        self.inner().find_handle_relation(handle)
    }

    fn pump(&self, mode: PumpMode, deadline: Deadline) -> Result<PumpStatistics> {
        self.inner().pump(mode, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{EventHandle, Handle};
    use std::rc::Rc;

    #[test]
    fn test_create() {
        let multiplexer = AnyMultiplexer::create().unwrap();
        assert!(!multiplexer.name().is_empty());
        assert!(multiplexer
            .find_handle_relation(HandleType::of::<EventHandle>())
            .is_ok());
    }

    #[test]
    fn test_block_through_any() {
        let multiplexer: Rc<dyn Multiplexer> =
            Rc::new(AnyMultiplexer::from(BlockingMultiplexer::new()));
        let mut event = EventHandle::new().unwrap();
        event.attach(multiplexer).unwrap();
        event.signal().unwrap();
        event.wait(Deadline::Instant).unwrap();
    }
}
