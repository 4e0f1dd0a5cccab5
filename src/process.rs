//! Target process handle and memory I/O
//!
//! Every patch borrows a [`Process`]: the identity of the address space whose
//! code it mutates. For the common in-process case use [`Process::current`];
//! raw patches and detours also work against another process opened with
//! [`Process::open`].

use crate::error::{Result, SpecterError};

// process access rights
const PROCESS_QUERY_INFORMATION: u32 = 0x0400;
const PROCESS_VM_OPERATION: u32 = 0x0008;
const PROCESS_VM_READ: u32 = 0x0010;
const PROCESS_VM_WRITE: u32 = 0x0020;
const PROCESS_SUSPEND_RESUME: u32 = 0x0800;

const PAGE_EXECUTE_READWRITE: u32 = 0x40;

/// handle to a target address space
///
/// carries the process id, an OS handle and the process bitness. the handle
/// for the current process is the pseudo-handle and is never closed.
pub struct Process {
    handle: usize,
    pid: u32,
    owns_handle: bool,
}

impl Process {
    /// the current process
    pub fn current() -> Self {
        // SAFETY: both return process-lifetime values, no failure mode
        let (handle, pid) = unsafe { (GetCurrentProcess(), GetCurrentProcessId()) };
        Self {
            handle: handle as usize,
            pid,
            owns_handle: false,
        }
    }

    /// open another process with the rights the patch engine needs
    pub fn open(pid: u32) -> Result<Self> {
        let rights = PROCESS_QUERY_INFORMATION
            | PROCESS_VM_OPERATION
            | PROCESS_VM_READ
            | PROCESS_VM_WRITE
            | PROCESS_SUSPEND_RESUME;

        // SAFETY: OpenProcess validates pid and rights
        let handle = unsafe { OpenProcess(rights, 0, pid) };
        if handle.is_null() {
            return Err(SpecterError::ProcessOpenFailed {
                pid,
                code: SpecterError::last_error(),
            });
        }

        Ok(Self {
            handle: handle as usize,
            pid,
            owns_handle: true,
        })
    }

    /// wrap an existing handle without taking ownership
    ///
    /// # Safety
    /// the handle must be valid, refer to `pid`, and carry query and VM
    /// access rights
    pub unsafe fn from_raw_handle(handle: usize, pid: u32) -> Self {
        Self {
            handle,
            pid,
            owns_handle: false,
        }
    }

    /// get the raw process handle
    pub fn handle(&self) -> usize {
        self.handle
    }

    /// get the process ID
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// whether this handle refers to the calling process
    pub fn is_current(&self) -> bool {
        // SAFETY: GetCurrentProcessId has no failure mode
        self.pid == unsafe { GetCurrentProcessId() }
    }

    /// whether the process runs under WoW64 (32-bit image on a 64-bit OS)
    pub fn is_wow64(&self) -> Result<bool> {
        let mut wow64: i32 = 0;
        // SAFETY: handle is valid for the lifetime of self
        let ok = unsafe { IsWow64Process(self.handle as *mut _, &mut wow64) };
        if ok == 0 {
            return Err(SpecterError::from_last_error("IsWow64Process"));
        }
        Ok(wow64 != 0)
    }

    /// whether the target address space is 64-bit
    pub fn is_64bit(&self) -> Result<bool> {
        if cfg!(target_arch = "x86") {
            // a 32-bit caller cannot patch a 64-bit target anyway
            return Ok(false);
        }
        Ok(!self.is_wow64()?)
    }

    /// read a byte range from the target process
    pub fn read_bytes(&self, address: usize, len: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut read: usize = 0;

        // SAFETY: buffer is len bytes, ReadProcessMemory bounds the copy
        let ok = unsafe {
            ReadProcessMemory(
                self.handle as *mut _,
                address as *const _,
                buffer.as_mut_ptr() as *mut _,
                len,
                &mut read,
            )
        };

        if ok == 0 || read != len {
            return Err(SpecterError::MemoryIo {
                op: "read",
                address,
                size: len,
                code: SpecterError::last_error(),
            });
        }

        Ok(buffer)
    }

    /// read a typed value from the target process
    pub fn read_value<T: Copy>(&self, address: usize) -> Result<T> {
        let buffer = self.read_bytes(address, core::mem::size_of::<T>())?;
        // SAFETY: buffer is exactly size_of::<T>() bytes
        Ok(unsafe { (buffer.as_ptr() as *const T).read_unaligned() })
    }

    /// write a byte range into the target process
    ///
    /// code pages are usually mapped without write access, so the range is
    /// temporarily flipped to RWX around the write.
    pub fn write_bytes(&self, address: usize, data: &[u8]) -> Result<()> {
        let _guard = self.protect_guard(address, data.len(), PAGE_EXECUTE_READWRITE)?;

        let mut written: usize = 0;
        // SAFETY: data lives across the call, protection was just widened
        let ok = unsafe {
            WriteProcessMemory(
                self.handle as *mut _,
                address as *mut _,
                data.as_ptr() as *const _,
                data.len(),
                &mut written,
            )
        };

        if ok == 0 || written != data.len() {
            return Err(SpecterError::MemoryIo {
                op: "write",
                address,
                size: data.len(),
                code: SpecterError::last_error(),
            });
        }

        Ok(())
    }

    /// write a typed value into the target process
    pub fn write_value<T: Copy>(&self, address: usize, value: &T) -> Result<()> {
        // SAFETY: T is Copy, plain-bytes view of the value
        let bytes = unsafe {
            core::slice::from_raw_parts(value as *const T as *const u8, core::mem::size_of::<T>())
        };
        self.write_bytes(address, bytes)
    }

    /// flush the instruction cache over a range of the target process
    pub fn flush_instruction_cache(&self, address: usize, len: usize) -> Result<()> {
        // SAFETY: FlushInstructionCache tolerates any range for a valid handle
        let ok = unsafe { FlushInstructionCache(self.handle as *mut _, address as *const _, len) };
        if ok == 0 {
            return Err(SpecterError::MemoryIo {
                op: "flush",
                address,
                size: len,
                code: SpecterError::last_error(),
            });
        }
        Ok(())
    }

    /// change protection of a range in the target process
    pub fn protect(&self, address: usize, size: usize, protection: u32) -> Result<u32> {
        let mut old: u32 = 0;
        // SAFETY: out-param is a local, the call validates the range
        let ok = unsafe {
            VirtualProtectEx(self.handle as *mut _, address as *mut _, size, protection, &mut old)
        };
        if ok == 0 {
            return Err(SpecterError::ProtectionChangeFailed {
                address,
                size,
                code: SpecterError::last_error(),
            });
        }
        Ok(old)
    }

    /// change protection with an RAII guard that restores on drop
    pub fn protect_guard(
        &self,
        address: usize,
        size: usize,
        protection: u32,
    ) -> Result<ProtectionGuard<'_>> {
        let old_protection = self.protect(address, size, protection)?;
        Ok(ProtectionGuard {
            process: self,
            address,
            size,
            old_protection,
        })
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.owns_handle && self.handle != 0 {
            // SAFETY: handle was opened by us and not closed elsewhere
            unsafe {
                CloseHandle(self.handle as *mut _);
            }
        }
    }
}

// SAFETY: a process handle is valid from any thread
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

/// RAII guard restoring memory protection in the target process
pub struct ProtectionGuard<'a> {
    process: &'a Process,
    address: usize,
    size: usize,
    old_protection: u32,
}

impl ProtectionGuard<'_> {
    /// the protection that will be restored
    pub fn old_protection(&self) -> u32 {
        self.old_protection
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .process
            .protect(self.address, self.size, self.old_protection);
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetCurrentProcess() -> *mut core::ffi::c_void;
    fn GetCurrentProcessId() -> u32;
    fn OpenProcess(desired_access: u32, inherit: i32, pid: u32) -> *mut core::ffi::c_void;
    fn CloseHandle(handle: *mut core::ffi::c_void) -> i32;
    fn IsWow64Process(process: *mut core::ffi::c_void, wow64: *mut i32) -> i32;

    fn ReadProcessMemory(
        process: *mut core::ffi::c_void,
        base: *const core::ffi::c_void,
        buffer: *mut core::ffi::c_void,
        size: usize,
        read: *mut usize,
    ) -> i32;

    fn WriteProcessMemory(
        process: *mut core::ffi::c_void,
        base: *mut core::ffi::c_void,
        buffer: *const core::ffi::c_void,
        size: usize,
        written: *mut usize,
    ) -> i32;

    fn FlushInstructionCache(
        process: *mut core::ffi::c_void,
        base: *const core::ffi::c_void,
        size: usize,
    ) -> i32;

    fn VirtualProtectEx(
        process: *mut core::ffi::c_void,
        address: *mut core::ffi::c_void,
        size: usize,
        protection: u32,
        old_protection: *mut u32,
    ) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process() {
        let process = Process::current();
        assert!(process.is_current());
        assert!(process.pid() > 0);
    }

    #[test]
    fn test_open_self() {
        let pid = Process::current().pid();
        let process = Process::open(pid).expect("should open current process");
        assert_eq!(process.pid(), pid);
        assert!(process.handle() != 0);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let process = Process::current();
        let mut slot: u64 = 0x1122334455667788;
        let addr = &mut slot as *mut u64 as usize;

        let value: u64 = process.read_value(addr).expect("read should succeed");
        assert_eq!(value, 0x1122334455667788);

        process
            .write_value(addr, &0xAABBCCDDu64)
            .expect("write should succeed");
        assert_eq!(slot, 0xAABBCCDD);
    }

    #[test]
    fn test_read_bytes_len() {
        let process = Process::current();
        let data = [0xDEu8, 0xAD, 0xBE, 0xEF];
        let bytes = process
            .read_bytes(data.as_ptr() as usize, data.len())
            .expect("read should succeed");
        assert_eq!(bytes, data);
    }

    #[test]
    fn test_bitness_matches_build() {
        let process = Process::current();
        let is_64 = process.is_64bit().expect("bitness query should succeed");
        assert_eq!(is_64, cfg!(target_arch = "x86_64"));
    }
}
