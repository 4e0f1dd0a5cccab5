//! Unified error types for specter

use core::fmt;

/// all errors that can occur in specter
#[derive(Debug)]
pub enum SpecterError {
    // === memory I/O ===
    /// memory operation against the target process failed
    MemoryIo {
        op: &'static str,
        address: usize,
        size: usize,
        code: u32,
    },

    /// failed to allocate memory in the target process
    AllocationFailed { size: usize, code: u32 },

    /// failed to change memory protection
    ProtectionChangeFailed { address: usize, size: usize, code: u32 },

    // === patch core ===
    /// the decoder refused an instruction at the given address
    Disasm { address: usize },

    /// every addressing strategy was exhausted for this jump
    UnreachableTarget { from: usize, to: usize },

    /// another thread's program counter is inside the range to be mutated
    BusyTarget { thread_id: u32, address: usize },

    // === breakpoint / debug-register strategies ===
    /// vectored exception handler registration failed
    ExceptionHandlerInstall { code: u32 },

    /// all four debug registers are in use on the calling thread
    NoFreeDebugRegister,

    /// breakpoint and debug-register hooks only work on the current process
    RemoteUnsupported,

    /// a breakpoint or debug-register hook already covers this address
    DuplicateHook { target: usize },

    /// base operation invoked without a strategy override
    Unimplemented { what: &'static str },

    // === process / thread ===
    /// failed to open the target process
    ProcessOpenFailed { pid: u32, code: u32 },

    /// failed to enumerate threads
    ThreadEnumFailed { code: u32 },

    /// failed to open a thread
    ThreadOpenFailed { tid: u32, code: u32 },

    /// SuspendThread/ResumeThread failed
    SuspendResumeFailed { tid: u32, code: u32 },

    /// GetThreadContext/SetThreadContext failed
    ContextAccessFailed { tid: u32, code: u32 },

    // === win32 ===
    /// underlying Win32 API returned error
    Win32Error { code: u32, context: &'static str },
}

impl fmt::Display for SpecterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemoryIo { op, address, size, code } => {
                write!(f, "memory {op} of {size} bytes at {address:#x} failed (code {code:#x})")
            }
            Self::AllocationFailed { size, code } => {
                write!(f, "failed to allocate {size} bytes (code {code:#x})")
            }
            Self::ProtectionChangeFailed { address, size, code } => {
                write!(
                    f,
                    "failed to change protection for {size} bytes at {address:#x} (code {code:#x})"
                )
            }
            Self::Disasm { address } => {
                write!(f, "disassembly failed at {address:#x}")
            }
            Self::UnreachableTarget { from, to } => {
                write!(f, "no jump strategy reaches {to:#x} from {from:#x}")
            }
            Self::BusyTarget { thread_id, address } => {
                write!(f, "thread {thread_id} is executing inside patch target {address:#x}")
            }
            Self::ExceptionHandlerInstall { code } => {
                write!(f, "AddVectoredExceptionHandler failed (code {code:#x})")
            }
            Self::NoFreeDebugRegister => {
                write!(f, "no free debug registers")
            }
            Self::RemoteUnsupported => {
                write!(f, "breakpoint hooks on remote processes are unsupported")
            }
            Self::DuplicateHook { target } => {
                write!(f, "a hook is already registered for {target:#x}")
            }
            Self::Unimplemented { what } => {
                write!(f, "{what} is not implemented for this patch kind")
            }
            Self::ProcessOpenFailed { pid, code } => {
                write!(f, "failed to open process {pid} (code {code:#x})")
            }
            Self::ThreadEnumFailed { code } => {
                write!(f, "thread enumeration failed (code {code:#x})")
            }
            Self::ThreadOpenFailed { tid, code } => {
                write!(f, "failed to open thread {tid} (code {code:#x})")
            }
            Self::SuspendResumeFailed { tid, code } => {
                write!(f, "suspend/resume of thread {tid} failed (code {code:#x})")
            }
            Self::ContextAccessFailed { tid, code } => {
                write!(f, "context access for thread {tid} failed (code {code:#x})")
            }
            Self::Win32Error { code, context } => {
                write!(f, "Win32 error {code:#x} in {context}")
            }
        }
    }
}

impl std::error::Error for SpecterError {}

/// result type alias using SpecterError
pub type Result<T> = std::result::Result<T, SpecterError>;

impl SpecterError {
    /// create Win32Error from GetLastError
    pub fn from_last_error(context: &'static str) -> Self {
        Self::Win32Error {
            code: Self::last_error(),
            context,
        }
    }

    /// the last-error code for the calling thread
    pub(crate) fn last_error() -> u32 {
        // SAFETY: GetLastError is always safe to call
        unsafe { GetLastError() }
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetLastError() -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_busy_target() {
        let err = SpecterError::BusyTarget {
            thread_id: 42,
            address: 0x1000,
        };
        let text = format!("{err}");
        assert!(text.contains("42"));
        assert!(text.contains("0x1000"));
    }

    #[test]
    fn test_display_unreachable() {
        let err = SpecterError::UnreachableTarget {
            from: 0x1000,
            to: 0x2000,
        };
        assert!(format!("{err}").contains("0x2000"));
    }
}
