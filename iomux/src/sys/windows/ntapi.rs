//! The parts of the native API the completion port backend needs. None of it is covered by
//! `winapi`.
#![allow(non_snake_case, non_camel_case_types)]

use std::ptr;
use std::time::Duration;

use winapi::shared::basetsd::ULONG_PTR;
use winapi::shared::minwindef::{BOOLEAN, ULONG};
use winapi::shared::ntdef::{HANDLE, LARGE_INTEGER, NTSTATUS, PVOID};

use crate::deadline::Deadline;

pub(crate) const FILE_COMPLETION_INFORMATION_CLASS: u32 = 30;
pub(crate) const FILE_REPLACE_COMPLETION_INFORMATION_CLASS: u32 = 61;

/// `IO_STATUS_BLOCK`. The status shares its word with a pointer, hence the padding on 64 bit.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct IoStatusBlock {
    pub status: NTSTATUS,
    pub information: ULONG_PTR,
}

impl IoStatusBlock {
    pub(crate) fn pending() -> IoStatusBlock {
        IoStatusBlock {
            status: winapi::shared::ntstatus::STATUS_PENDING,
            information: 0,
        }
    }
}

/// `FILE_IO_COMPLETION_INFORMATION`, one dequeued completion packet.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct CompletionEntry {
    pub key_context: PVOID,
    pub apc_context: PVOID,
    pub io_status: IoStatusBlock,
}

impl Default for CompletionEntry {
    fn default() -> Self {
        CompletionEntry {
            key_context: ptr::null_mut(),
            apc_context: ptr::null_mut(),
            io_status: IoStatusBlock {
                status: 0,
                information: 0,
            },
        }
    }
}

#[repr(C)]
pub(crate) struct FileCompletionInformation {
    pub port: HANDLE,
    pub key: PVOID,
}

#[link(name = "ntdll")]
extern "system" {
    pub(crate) fn NtReadFile(
        FileHandle: HANDLE,
        Event: HANDLE,
        ApcRoutine: PVOID,
        ApcContext: PVOID,
        IoStatusBlock: *mut IoStatusBlock,
        Buffer: PVOID,
        Length: ULONG,
        ByteOffset: *mut LARGE_INTEGER,
        Key: *mut ULONG,
    ) -> NTSTATUS;

    pub(crate) fn NtWriteFile(
        FileHandle: HANDLE,
        Event: HANDLE,
        ApcRoutine: PVOID,
        ApcContext: PVOID,
        IoStatusBlock: *mut IoStatusBlock,
        Buffer: PVOID,
        Length: ULONG,
        ByteOffset: *mut LARGE_INTEGER,
        Key: *mut ULONG,
    ) -> NTSTATUS;

    pub(crate) fn NtCancelIoFileEx(
        FileHandle: HANDLE,
        IoRequestToCancel: *mut IoStatusBlock,
        IoStatusBlock: *mut IoStatusBlock,
    ) -> NTSTATUS;

    pub(crate) fn NtSetInformationFile(
        FileHandle: HANDLE,
        IoStatusBlock: *mut IoStatusBlock,
        FileInformation: PVOID,
        Length: ULONG,
        FileInformationClass: u32,
    ) -> NTSTATUS;

    pub(crate) fn NtRemoveIoCompletionEx(
        IoCompletionHandle: HANDLE,
        IoCompletionInformation: *mut CompletionEntry,
        Count: ULONG,
        NumEntriesRemoved: *mut ULONG,
        Timeout: *mut LARGE_INTEGER,
        Alertable: BOOLEAN,
    ) -> NTSTATUS;

    pub(crate) fn NtCreateWaitCompletionPacket(
        WaitCompletionPacketHandle: *mut HANDLE,
        DesiredAccess: ULONG,
        ObjectAttributes: PVOID,
    ) -> NTSTATUS;

    pub(crate) fn NtAssociateWaitCompletionPacket(
        WaitCompletionPacketHandle: HANDLE,
        IoCompletionHandle: HANDLE,
        TargetObjectHandle: HANDLE,
        KeyContext: PVOID,
        ApcContext: PVOID,
        IoStatus: NTSTATUS,
        IoStatusInformation: ULONG_PTR,
        AlreadySignaled: *mut BOOLEAN,
    ) -> NTSTATUS;

    pub(crate) fn NtCancelWaitCompletionPacket(
        WaitCompletionPacketHandle: HANDLE,
        RemoveSignaledPacket: BOOLEAN,
    ) -> NTSTATUS;

    pub(crate) fn RtlNtStatusToDosError(Status: NTSTATUS) -> ULONG;
}

#[inline]
pub(crate) fn nt_success(status: NTSTATUS) -> bool {
    status >= 0
}

/// Relative kernel timeout in 100ns units.
pub(crate) fn relative_timeout(duration: Duration) -> LARGE_INTEGER {
    let ticks = duration.as_nanos() / 100;
    let ticks = if ticks > i64::MAX as u128 { i64::MAX } else { ticks as i64 };
    let mut timeout: LARGE_INTEGER = unsafe { std::mem::zeroed() };
    unsafe { *timeout.QuadPart_mut() = -ticks };
    timeout
}

/// Timeout argument for a deadline: null waits forever.
pub(crate) struct KernelTimeout {
    value: Option<LARGE_INTEGER>,
}

impl KernelTimeout {
    pub(crate) fn new(deadline: Deadline) -> KernelTimeout {
        KernelTimeout {
            value: deadline.remaining().map(relative_timeout),
        }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut LARGE_INTEGER {
        match self.value.as_mut() {
            Some(value) => value,
            None => ptr::null_mut(),
        }
    }
}
