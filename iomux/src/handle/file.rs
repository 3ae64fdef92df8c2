use crate::handle::transfer::{block_transfer, Direction, Position, Transfer, TransferParams};
use crate::handle::{Handle, HandleView, IoOperation, NativeHandle, PlatformHandle};
use crate::sender::Sender;
use crate::Result;

/// A random access file.
///
/// On Windows the file must have been opened for overlapped I/O to be attached to a completion
/// port.
#[derive(Debug)]
pub struct FileHandle {
    platform: PlatformHandle,
}

impl FileHandle {
    /// Take ownership of a native file descriptor.
    ///
    /// # Safety
    /// `native` must be an open file that nothing else closes.
    pub unsafe fn from_native(native: NativeHandle) -> FileHandle {
        FileHandle {
            platform: PlatformHandle::new(native, super::close_native),
        }
    }

    pub fn from_std(file: std::fs::File) -> FileHandle {
        #[cfg(unix)]
        let raw = std::os::unix::io::IntoRawFd::into_raw_fd(file);
        #[cfg(windows)]
        let raw = std::os::windows::io::IntoRawHandle::into_raw_handle(file);
        unsafe { FileHandle::from_native(NativeHandle::new(raw)) }
    }

    /// Read into `buffers` starting at `offset`, blocking until done.
    pub fn read_at(&self, offset: u64, buffers: Vec<Vec<u8>>) -> Result<Transfer> {
        self.platform.block::<ScatterReadAt>(TransferParams {
            position: Position::At(offset),
            buffers,
        })
    }

    pub fn write_at(&self, offset: u64, buffers: Vec<Vec<u8>>) -> Result<Transfer> {
        self.platform.block::<GatherWriteAt>(TransferParams {
            position: Position::At(offset),
            buffers,
        })
    }

    /// Flush file data and metadata to the device.
    pub fn flush(&self) -> Result<()> {
        self.platform.block::<Flush>(())
    }

    pub fn read_at_async(&self, offset: u64, buffers: Vec<Vec<u8>>) -> Sender<'_, ScatterReadAt> {
        self.platform.sender(TransferParams {
            position: Position::At(offset),
            buffers,
        })
    }

    pub fn write_at_async(&self, offset: u64, buffers: Vec<Vec<u8>>) -> Sender<'_, GatherWriteAt> {
        self.platform.sender(TransferParams {
            position: Position::At(offset),
            buffers,
        })
    }
}

impl Handle for FileHandle {
    const NAME: &'static str = "file";

    fn platform(&self) -> &PlatformHandle {
        &self.platform
    }

    fn platform_mut(&mut self) -> &mut PlatformHandle {
        &mut self.platform
    }
}

/// Read at an offset into one or more buffers.
#[derive(Debug)]
pub struct ScatterReadAt;

impl IoOperation for ScatterReadAt {
    type Handle = FileHandle;
    type Params = TransferParams;
    type Output = Transfer;

    const INDEX: usize = 0;
    const NAME: &'static str = "scatter_read_at";

    fn block(handle: &HandleView, params: TransferParams) -> Result<Transfer> {
        block_transfer(handle.native, Direction::Read, params)
    }
}

/// Write one or more buffers at an offset.
#[derive(Debug)]
pub struct GatherWriteAt;

impl IoOperation for GatherWriteAt {
    type Handle = FileHandle;
    type Params = TransferParams;
    type Output = Transfer;

    const INDEX: usize = 1;
    const NAME: &'static str = "gather_write_at";

    fn block(handle: &HandleView, params: TransferParams) -> Result<Transfer> {
        block_transfer(handle.native, Direction::Write, params)
    }
}

#[derive(Debug)]
pub struct Flush;

impl IoOperation for Flush {
    type Handle = FileHandle;
    type Params = ();
    type Output = ();

    const INDEX: usize = 2;
    const NAME: &'static str = "flush";
    const BOUNDED: bool = true;

    fn block(handle: &HandleView, _: ()) -> Result<()> {
        #[cfg(unix)]
        {
            nix::unistd::fsync(handle.native.raw())?;
        }
        #[cfg(windows)]
        {
            let ok = unsafe { winapi::um::fileapi::FlushFileBuffers(handle.native.raw() as _) };
            if ok == 0 {
                return Err(crate::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::multiplexer::BlockingMultiplexer;
    use crate::test_utils::tempfile;
    use crate::Error;
    use std::rc::Rc;

    #[test]
    fn test_detached() {
        let file = FileHandle::from_std(tempfile());
        let written = file
            .write_at(0, vec![b"abc".to_vec(), b"defg".to_vec()])
            .unwrap();
        assert_eq!(7, written.transferred);
        file.flush().unwrap();

        let read = file.read_at(2, vec![vec![0; 3], vec![0; 8]]).unwrap();
        assert_eq!(5, read.transferred);
        assert_eq!(b"cde", &read.buffers[0][..]);
        assert_eq!(b"fg", &read.buffers[1][..2]);
    }

    #[test]
    fn test_attached_blocking() {
        let mut file = FileHandle::from_std(tempfile());
        file.attach(Rc::new(BlockingMultiplexer::new())).unwrap();
        assert!(file.platform().is_attached());
        assert_eq!(
            Error::InvalidArgument,
            file.attach(Rc::new(BlockingMultiplexer::new())).unwrap_err()
        );

        file.write_at(0, vec![b"0123456789".to_vec()]).unwrap();
        let read = file.read_at(8, vec![vec![0; 4]]).unwrap();
        assert_eq!(2, read.transferred);

        file.detach().unwrap();
        assert_eq!(Error::HandleIsNotMultiplexable, file.detach().unwrap_err());
    }

    #[test]
    fn test_release() {
        let file = FileHandle::from_std(tempfile());
        let FileHandle { platform } = file;
        let native = platform.release().unwrap();
        assert!(!native.is_null());
        nix::unistd::close(native.raw()).unwrap();
    }
}
