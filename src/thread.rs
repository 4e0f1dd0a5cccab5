//! Thread enumeration, suspension and context access
//!
//! The patch core only ever mutates code while every other thread of the
//! target process is frozen; [`FreezeGuard`] provides that window and
//! [`verify_threads_not_executing`] proves no frozen thread is mid-flight in
//! the bytes about to change.

use crate::error::{Result, SpecterError};

// thread access rights
const THREAD_GET_CONTEXT: u32 = 0x0008;
const THREAD_SET_CONTEXT: u32 = 0x0010;
const THREAD_QUERY_INFORMATION: u32 = 0x0040;
const THREAD_SUSPEND_RESUME: u32 = 0x0002;

// context flag sets for the current architecture
#[cfg(target_arch = "x86_64")]
const CONTEXT_ARCH: u32 = 0x0010_0000;
#[cfg(target_arch = "x86")]
const CONTEXT_ARCH: u32 = 0x0001_0000;

/// request the control registers (program counter, stack, flags)
pub const CONTEXT_CONTROL: u32 = CONTEXT_ARCH | 0x1;
/// request the debug registers (Dr0-Dr7)
pub const CONTEXT_DEBUG_REGISTERS: u32 = CONTEXT_ARCH | 0x10;

/// the id of the calling thread
pub fn current_thread_id() -> u32 {
    // SAFETY: GetCurrentThreadId has no failure mode
    unsafe { GetCurrentThreadId() }
}

/// thread entry from a toolhelp snapshot
#[derive(Debug, Clone)]
pub struct ThreadEntry {
    pub thread_id: u32,
    pub owner_process_id: u32,
    pub base_priority: i32,
}

/// iterator over the threads of one process
pub struct ThreadIterator {
    snapshot: *mut core::ffi::c_void,
    first: bool,
    target_pid: u32,
}

impl ThreadIterator {
    /// enumerate threads of a specific process
    pub fn for_process(pid: u32) -> Result<Self> {
        // SAFETY: CreateToolhelp32Snapshot is safe to call with valid flags
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };

        if snapshot == INVALID_HANDLE_VALUE {
            return Err(SpecterError::ThreadEnumFailed {
                code: SpecterError::last_error(),
            });
        }

        Ok(Self {
            snapshot,
            first: true,
            target_pid: pid,
        })
    }
}

impl Iterator for ThreadIterator {
    type Item = ThreadEntry;

    fn next(&mut self) -> Option<Self::Item> {
        let mut entry = RawThreadEntry32 {
            size: core::mem::size_of::<RawThreadEntry32>() as u32,
            ..Default::default()
        };

        loop {
            // SAFETY: snapshot is valid, entry is correctly sized
            let success = if self.first {
                self.first = false;
                unsafe { Thread32First(self.snapshot, &mut entry) }
            } else {
                unsafe { Thread32Next(self.snapshot, &mut entry) }
            };

            if success == 0 {
                return None;
            }

            if entry.owner_process_id == self.target_pid {
                return Some(ThreadEntry {
                    thread_id: entry.thread_id,
                    owner_process_id: entry.owner_process_id,
                    base_priority: entry.base_priority,
                });
            }
        }
    }
}

impl Drop for ThreadIterator {
    fn drop(&mut self) {
        if self.snapshot != INVALID_HANDLE_VALUE {
            // SAFETY: snapshot is a valid handle
            unsafe {
                CloseHandle(self.snapshot);
            }
        }
    }
}

/// open thread handle with suspend and context rights
pub struct Thread {
    handle: *mut core::ffi::c_void,
    tid: u32,
}

impl Thread {
    /// open a thread by id
    pub fn open(tid: u32) -> Result<Self> {
        let rights = THREAD_GET_CONTEXT
            | THREAD_SET_CONTEXT
            | THREAD_QUERY_INFORMATION
            | THREAD_SUSPEND_RESUME;

        // SAFETY: OpenThread validates tid and rights
        let handle = unsafe { OpenThread(rights, 0, tid) };
        if handle.is_null() {
            return Err(SpecterError::ThreadOpenFailed {
                tid,
                code: SpecterError::last_error(),
            });
        }

        Ok(Self { handle, tid })
    }

    /// open the calling thread through its pseudo-handle
    pub fn current() -> Self {
        // SAFETY: both calls have no failure mode
        unsafe {
            Self {
                handle: GetCurrentThread(),
                tid: GetCurrentThreadId(),
            }
        }
    }

    /// get the thread id
    pub fn id(&self) -> u32 {
        self.tid
    }

    /// suspend the thread, returning the previous suspend count
    pub fn suspend(&self) -> Result<u32> {
        // SAFETY: handle carries THREAD_SUSPEND_RESUME
        let count = unsafe { SuspendThread(self.handle) };
        if count == u32::MAX {
            Err(SpecterError::SuspendResumeFailed {
                tid: self.tid,
                code: SpecterError::last_error(),
            })
        } else {
            Ok(count)
        }
    }

    /// resume the thread, returning the previous suspend count
    pub fn resume(&self) -> Result<u32> {
        // SAFETY: handle carries THREAD_SUSPEND_RESUME
        let count = unsafe { ResumeThread(self.handle) };
        if count == u32::MAX {
            Err(SpecterError::SuspendResumeFailed {
                tid: self.tid,
                code: SpecterError::last_error(),
            })
        } else {
            Ok(count)
        }
    }

    /// read the thread context for the requested register sets
    ///
    /// the thread must be suspended (or be the calling thread) for the
    /// snapshot to be meaningful.
    pub fn context(&self, flags: u32) -> Result<Context> {
        let mut context = Context::with_flags(flags);
        // SAFETY: context is a full-size CONTEXT with the flags set
        let ok = unsafe { GetThreadContext(self.handle, &mut context) };
        if ok == 0 {
            return Err(SpecterError::ContextAccessFailed {
                tid: self.tid,
                code: SpecterError::last_error(),
            });
        }
        Ok(context)
    }

    /// commit a modified context back to the thread
    pub fn set_context(&self, context: &Context) -> Result<()> {
        // SAFETY: context was produced by GetThreadContext for this arch
        let ok = unsafe { SetThreadContext(self.handle, context) };
        if ok == 0 {
            return Err(SpecterError::ContextAccessFailed {
                tid: self.tid,
                code: SpecterError::last_error(),
            });
        }
        Ok(())
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // pseudo-handles (negative values) must not be closed
        if !self.handle.is_null() && (self.handle as isize) > 0 {
            // SAFETY: handle was opened by us
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

// SAFETY: a thread handle is valid from any thread
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

/// all threads of a process suspended except the caller, resumed on drop
///
/// snapshots are re-taken until a pass finds nothing new, so a thread spawned
/// while the freeze is underway cannot slip past it.
pub struct FreezeGuard {
    frozen: Vec<Thread>,
}

impl FreezeGuard {
    /// suspend every other thread of the given process
    pub fn freeze(pid: u32) -> Result<Self> {
        let current = current_thread_id();
        let mut frozen: Vec<Thread> = Vec::new();

        loop {
            let mut new_this_pass = 0usize;

            for entry in ThreadIterator::for_process(pid)? {
                if entry.thread_id == current {
                    continue;
                }
                if frozen.iter().any(|t| t.id() == entry.thread_id) {
                    continue;
                }

                // a thread may exit between snapshot and open; skip it
                let thread = match Thread::open(entry.thread_id) {
                    Ok(thread) => thread,
                    Err(_) => continue,
                };

                if thread.suspend().is_err() {
                    continue;
                }

                frozen.push(thread);
                new_this_pass += 1;
            }

            if new_this_pass == 0 {
                break;
            }
        }

        Ok(Self { frozen })
    }

    /// how many threads are held suspended
    pub fn count(&self) -> usize {
        self.frozen.len()
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        for thread in &self.frozen {
            let _ = thread.resume();
        }
    }
}

/// whether a suspended thread's program counter lies in `[lo, hi)`
pub fn is_executing_in_range(entry: &ThreadEntry, lo: usize, hi: usize) -> Result<bool> {
    let thread = Thread::open(entry.thread_id)?;
    let context = thread.context(CONTEXT_CONTROL)?;
    let pc = context.pc();
    Ok(pc >= lo && pc < hi)
}

/// fail with `BusyTarget` if any other thread's program counter is inside one
/// of the given half-open ranges
pub fn verify_threads_not_executing(pid: u32, ranges: &[(usize, usize)]) -> Result<()> {
    let current = current_thread_id();

    for entry in ThreadIterator::for_process(pid)? {
        if entry.thread_id == current {
            continue;
        }

        for &(lo, hi) in ranges {
            // a thread that died since the snapshot cannot be mid-flight
            match is_executing_in_range(&entry, lo, hi) {
                Ok(true) => {
                    return Err(SpecterError::BusyTarget {
                        thread_id: entry.thread_id,
                        address: lo,
                    })
                }
                Ok(false) => {}
                Err(_) => break,
            }
        }
    }

    Ok(())
}

/// thread context with control and debug registers
///
/// mirrors the OS CONTEXT layout for the build architecture. the trailing
/// extended-state area is carried so the kernel can write the full record.
#[repr(C, align(16))]
#[cfg(target_arch = "x86_64")]
pub struct Context {
    p1_home: u64,
    p2_home: u64,
    p3_home: u64,
    p4_home: u64,
    p5_home: u64,
    p6_home: u64,
    context_flags: u32,
    mx_csr: u32,
    seg_cs: u16,
    seg_ds: u16,
    seg_es: u16,
    seg_fs: u16,
    seg_gs: u16,
    seg_ss: u16,
    eflags: u32,
    dr0: u64,
    dr1: u64,
    dr2: u64,
    dr3: u64,
    dr6: u64,
    dr7: u64,
    rax: u64,
    rcx: u64,
    rdx: u64,
    rbx: u64,
    rsp: u64,
    rbp: u64,
    rsi: u64,
    rdi: u64,
    r8: u64,
    r9: u64,
    r10: u64,
    r11: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
    flt_save: [u8; 512],
    vector_register: [u8; 416],
    vector_control: u64,
    debug_control: u64,
    last_branch_to_rip: u64,
    last_branch_from_rip: u64,
    last_exception_to_rip: u64,
    last_exception_from_rip: u64,
}

#[repr(C, align(16))]
#[cfg(target_arch = "x86")]
pub struct Context {
    context_flags: u32,
    dr0: u32,
    dr1: u32,
    dr2: u32,
    dr3: u32,
    dr6: u32,
    dr7: u32,
    float_save: [u8; 112],
    seg_gs: u32,
    seg_fs: u32,
    seg_es: u32,
    seg_ds: u32,
    edi: u32,
    esi: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    ebp: u32,
    eip: u32,
    seg_cs: u32,
    eflags: u32,
    esp: u32,
    seg_ss: u32,
    extended_registers: [u8; 512],
}

impl Context {
    /// a zeroed context requesting the given register sets
    pub fn with_flags(flags: u32) -> Self {
        // SAFETY: CONTEXT is plain data, all-zero is a valid state
        let mut context: Self = unsafe { core::mem::zeroed() };
        context.context_flags = flags;
        context
    }

    /// the program counter
    pub fn pc(&self) -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip as usize
        }
        #[cfg(target_arch = "x86")]
        {
            self.eip as usize
        }
    }

    /// rewrite the program counter
    pub fn set_pc(&mut self, pc: usize) {
        #[cfg(target_arch = "x86_64")]
        {
            self.rip = pc as u64;
        }
        #[cfg(target_arch = "x86")]
        {
            self.eip = pc as u32;
        }
    }

    /// the flags register
    pub fn eflags(&self) -> u32 {
        self.eflags
    }

    /// rewrite the flags register
    pub fn set_eflags(&mut self, eflags: u32) {
        self.eflags = eflags;
    }

    /// read one of Dr0-Dr3
    pub fn dr(&self, index: u32) -> usize {
        match index {
            0 => self.dr0 as usize,
            1 => self.dr1 as usize,
            2 => self.dr2 as usize,
            _ => self.dr3 as usize,
        }
    }

    /// write one of Dr0-Dr3
    pub fn set_dr(&mut self, index: u32, value: usize) {
        let value = value as _;
        match index {
            0 => self.dr0 = value,
            1 => self.dr1 = value,
            2 => self.dr2 = value,
            _ => self.dr3 = value,
        }
    }

    /// the debug status register
    pub fn dr6(&self) -> usize {
        self.dr6 as usize
    }

    /// rewrite the debug status register
    pub fn set_dr6(&mut self, value: usize) {
        self.dr6 = value as _;
    }

    /// the debug control register
    pub fn dr7(&self) -> usize {
        self.dr7 as usize
    }

    /// rewrite the debug control register
    pub fn set_dr7(&mut self, value: usize) {
        self.dr7 = value as _;
    }
}

// internal structures for toolhelp
#[repr(C)]
#[derive(Default)]
struct RawThreadEntry32 {
    size: u32,
    usage: u32,
    thread_id: u32,
    owner_process_id: u32,
    base_priority: i32,
    delta_priority: i32,
    flags: u32,
}

const TH32CS_SNAPTHREAD: u32 = 0x0000_0004;
const INVALID_HANDLE_VALUE: *mut core::ffi::c_void = -1isize as *mut _;

#[link(name = "kernel32")]
extern "system" {
    fn CreateToolhelp32Snapshot(flags: u32, process_id: u32) -> *mut core::ffi::c_void;
    fn Thread32First(snapshot: *mut core::ffi::c_void, entry: *mut RawThreadEntry32) -> i32;
    fn Thread32Next(snapshot: *mut core::ffi::c_void, entry: *mut RawThreadEntry32) -> i32;
    fn CloseHandle(handle: *mut core::ffi::c_void) -> i32;

    fn OpenThread(desired_access: u32, inherit: i32, tid: u32) -> *mut core::ffi::c_void;
    fn GetCurrentThread() -> *mut core::ffi::c_void;
    fn GetCurrentThreadId() -> u32;
    fn SuspendThread(thread: *mut core::ffi::c_void) -> u32;
    fn ResumeThread(thread: *mut core::ffi::c_void) -> u32;
    fn GetThreadContext(thread: *mut core::ffi::c_void, context: *mut Context) -> i32;
    fn SetThreadContext(thread: *mut core::ffi::c_void, context: *const Context) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_iterator_sees_self() {
        let pid = crate::process::Process::current().pid();
        let tids: Vec<u32> = ThreadIterator::for_process(pid)
            .expect("should create iterator")
            .map(|t| t.thread_id)
            .collect();

        assert!(!tids.is_empty());
        assert!(tids.contains(&current_thread_id()));
    }

    #[test]
    fn test_freeze_excludes_caller() {
        let pid = crate::process::Process::current().pid();
        let guard = FreezeGuard::freeze(pid).expect("freeze should succeed");

        // the caller keeps running, so this code is executing right now
        let current = current_thread_id();
        assert!(current > 0);
        drop(guard);
    }

    #[test]
    fn test_verify_empty_range_passes() {
        let pid = crate::process::Process::current().pid();
        let _guard = FreezeGuard::freeze(pid).expect("freeze should succeed");
        // an empty range can never contain a program counter
        verify_threads_not_executing(pid, &[(0x1000, 0x1000)])
            .expect("no thread can be inside an empty range");
    }

    #[test]
    fn test_context_pc_roundtrip() {
        let mut context = Context::with_flags(CONTEXT_CONTROL);
        context.set_pc(0x1234_5678);
        assert_eq!(context.pc(), 0x1234_5678);
    }

    #[test]
    fn test_context_dr_roundtrip() {
        let mut context = Context::with_flags(CONTEXT_DEBUG_REGISTERS);
        for i in 0..4 {
            context.set_dr(i, 0x1000 + i as usize);
        }
        for i in 0..4 {
            assert_eq!(context.dr(i), 0x1000 + i as usize);
        }
    }

    #[test]
    fn test_current_thread_context() {
        let thread = Thread::current();
        let context = thread
            .context(CONTEXT_DEBUG_REGISTERS)
            .expect("own context should be readable");
        // no hardware breakpoints expected in a fresh test thread
        let _ = context.dr7();
    }
}
