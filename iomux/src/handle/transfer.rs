//! Parameters, results and blocking implementations of buffer transfers.
use crate::handle::NativeHandle;
use crate::operation::composite::{Issue, ScatterGather};
use crate::Result;

/// Position of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Absolute offset into a random access handle.
    At(u64),
    /// The current position of a stream.
    Stream,
}

impl Position {
    pub(crate) fn advance(self, transferred: usize) -> Position {
        match self {
            Position::At(offset) => Position::At(offset + transferred as u64),
            Position::Stream => Position::Stream,
        }
    }
}

/// Buffers to read into or write from.
///
/// Reads fill each buffer up to its length; buffers are handed back with the result.
#[derive(Debug)]
pub struct TransferParams {
    pub position: Position,
    pub buffers: Vec<Vec<u8>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Transfer {
    pub buffers: Vec<Vec<u8>>,
    pub transferred: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

/// Transfer buffer by buffer, stopping at the first short or failed transfer.
pub(crate) fn block_transfer(
    native: NativeHandle,
    direction: Direction,
    params: TransferParams,
) -> Result<Transfer> {
    let TransferParams {
        mut position,
        mut buffers,
    } = params;
    let mut sg = ScatterGather::new(buffers.iter().map(Vec::len))?;
    sg.issue_each(|index| {
        let result = sys::transfer(native, direction, position, &mut buffers[index]);
        if let Ok(transferred) = result {
            position = position.advance(transferred);
        }
        Issue::Completed(result)
    });
    let transferred = sg.transferred()?;
    Ok(Transfer {
        buffers,
        transferred,
    })
}

#[cfg(unix)]
mod sys {
    use nix::errno::Errno;
    use nix::sys::uio::{pread, pwrite};
    use nix::unistd::{read, write};

    use super::{Direction, Position};
    use crate::handle::NativeHandle;
    use crate::Result;

    pub(super) fn transfer(
        native: NativeHandle,
        direction: Direction,
        position: Position,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let fd = native.raw();
        loop {
            let result = match (direction, position) {
                (Direction::Read, Position::At(offset)) => pread(fd, buffer, offset as libc::off_t),
                (Direction::Read, Position::Stream) => read(fd, buffer),
                (Direction::Write, Position::At(offset)) => {
                    pwrite(fd, buffer, offset as libc::off_t)
                }
                (Direction::Write, Position::Stream) => write(fd, buffer),
            };
            match result {
                Err(Errno::EINTR) => continue,
                result => return Ok(result?),
            }
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::mem;
    use std::ptr;

    use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
    use winapi::shared::winerror::{ERROR_HANDLE_EOF, ERROR_IO_PENDING};
    use winapi::um::errhandlingapi::GetLastError;
    use winapi::um::fileapi::{ReadFile, WriteFile};
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::ioapiset::GetOverlappedResult;
    use winapi::um::minwinbase::OVERLAPPED;
    use winapi::um::synchapi::CreateEventW;

    use super::{Direction, Position};
    use crate::handle::NativeHandle;
    use crate::{Error, Result};

    pub(super) fn transfer(
        native: NativeHandle,
        direction: Direction,
        position: Position,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let handle = native.raw() as winapi::shared::ntdef::HANDLE;
        let event = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
        if event.is_null() {
            return Err(Error::last_os_error());
        }
        let _event = scopeguard::guard(event, |event| unsafe {
            CloseHandle(event);
        });

        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        let offset = match position {
            Position::At(offset) => offset,
            Position::Stream => 0,
        };
        unsafe {
            let s = overlapped.u.s_mut();
            s.Offset = offset as DWORD;
            s.OffsetHigh = (offset >> 32) as DWORD;
        }
        // The low bit keeps the completion off any port the handle is associated with.
        overlapped.hEvent = (event as usize | 1) as _;

        let len = std::cmp::min(buffer.len(), DWORD::MAX as usize) as DWORD;
        let mut transferred: DWORD = 0;
        let ok = unsafe {
            match direction {
                Direction::Read => ReadFile(
                    handle,
                    buffer.as_mut_ptr() as _,
                    len,
                    &mut transferred,
                    &mut overlapped,
                ),
                Direction::Write => WriteFile(
                    handle,
                    buffer.as_ptr() as _,
                    len,
                    &mut transferred,
                    &mut overlapped,
                ),
            }
        };
        if ok == FALSE {
            let mut error = unsafe { GetLastError() };
            if error == ERROR_IO_PENDING {
                let ok = unsafe { GetOverlappedResult(handle, &mut overlapped, &mut transferred, TRUE) };
                error = if ok == FALSE { unsafe { GetLastError() } } else { 0 };
            }
            match error {
                0 => {}
                ERROR_HANDLE_EOF => return Ok(0),
                error => return Err(Error::from_raw_os_error(error as i32)),
            }
        }
        Ok(transferred as usize)
    }
}
