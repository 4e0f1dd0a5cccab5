//! Breakpoint and debug-register patches
//!
//! Both strategies leave the redirection to a process-wide vectored exception
//! handler: the breakpoint kind plants a single `0xCC`, the debug-register
//! kind arms a hardware execute breakpoint and modifies no code at all. The
//! handler looks the faulting address up in a shared registry and rewrites
//! the thread's program counter to the detour.
//!
//! The registry and the handler are process singletons, installed on the
//! first patch and never torn down; the OS hands every exception to one
//! handler chain, so there is nothing per-patch to own.

use crate::error::{Result, SpecterError};
use crate::process::Process;
use crate::thread::{current_thread_id, Context, Thread, CONTEXT_DEBUG_REGISTERS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::RwLock;

use super::detour::{DetourPatch, RedirectKind};

const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// hooks dispatched by the exception handler
///
/// every key belongs to a patch in applied state; install and remove hold the
/// write lock, the dispatcher reads under the shared lock.
#[derive(Default)]
struct VehRegistry {
    /// faulting address -> detour to resume at
    hooks: HashMap<usize, usize>,
    /// thread id -> debug register index armed for that thread
    dr_hooks: HashMap<u32, u32>,
}

static REGISTRY: RwLock<Option<VehRegistry>> = RwLock::new(None);
static DISPATCHER_INSTALLED: AtomicBool = AtomicBool::new(false);

/// software breakpoint patch: one `0xCC` plus exception dispatch
///
/// does not support hook chaining; the registry is keyed by address, so a
/// second patch on the same target is rejected.
pub struct BreakpointPatch<'a> {
    inner: DetourPatch<'a>,
}

impl<'a> BreakpointPatch<'a> {
    /// record a breakpoint plan; installs the exception handler on first use
    pub fn new(process: &'a Process, target: usize, detour: usize) -> Result<Self> {
        if !process.is_current() {
            return Err(SpecterError::RemoteUnsupported);
        }
        ensure_dispatcher()?;
        Ok(Self {
            inner: DetourPatch::with_kind(process, target, detour, RedirectKind::Breakpoint),
        })
    }

    /// whether the patch is currently installed
    pub fn is_applied(&self) -> bool {
        self.inner.is_applied()
    }

    /// plant the breakpoint and register it for dispatch
    pub fn apply(&mut self) -> Result<()> {
        self.inner.apply()
    }

    /// restore the original byte and unregister
    pub fn remove(&mut self) -> Result<()> {
        self.inner.remove()
    }

    /// mark the patch inert forever
    pub fn detach(&mut self) {
        self.inner.detach();
    }

    /// entry point of the relocated original
    pub fn trampoline_ptr(&self) -> Option<usize> {
        self.inner.trampoline_ptr()
    }

    /// the user-managed reference counter
    pub fn ref_count(&self) -> &AtomicU32 {
        self.inner.ref_count()
    }

    /// breakpoint hooks cannot be chained
    pub fn can_hook_chain(&self) -> bool {
        self.inner.can_hook_chain()
    }
}

/// hardware breakpoint patch: a debug register armed on the calling thread
///
/// Known limits, recorded rather than papered over: only the calling thread
/// is hooked, one hook per thread, no arbitration with other users of the
/// debug registers, no handling of thread-id reuse.
pub struct DebugRegisterPatch<'a> {
    inner: DetourPatch<'a>,
}

impl<'a> DebugRegisterPatch<'a> {
    /// record a debug-register plan; installs the exception handler on first
    /// use
    pub fn new(process: &'a Process, target: usize, detour: usize) -> Result<Self> {
        if !process.is_current() {
            return Err(SpecterError::RemoteUnsupported);
        }
        ensure_dispatcher()?;
        Ok(Self {
            inner: DetourPatch::with_kind(process, target, detour, RedirectKind::DebugRegister),
        })
    }

    /// whether the patch is currently installed
    pub fn is_applied(&self) -> bool {
        self.inner.is_applied()
    }

    /// arm a debug register on the calling thread and register for dispatch
    pub fn apply(&mut self) -> Result<()> {
        self.inner.apply()
    }

    /// disarm the debug register and unregister; must run on the thread that
    /// applied the hook
    pub fn remove(&mut self) -> Result<()> {
        self.inner.remove()
    }

    /// mark the patch inert forever
    pub fn detach(&mut self) {
        self.inner.detach();
    }

    /// entry point of the relocated original
    pub fn trampoline_ptr(&self) -> Option<usize> {
        self.inner.trampoline_ptr()
    }

    /// the user-managed reference counter
    pub fn ref_count(&self) -> &AtomicU32 {
        self.inner.ref_count()
    }

    /// debug-register hooks cannot be chained
    pub fn can_hook_chain(&self) -> bool {
        self.inner.can_hook_chain()
    }
}

/// install the vectored handler once for the life of the process
fn ensure_dispatcher() -> Result<()> {
    if DISPATCHER_INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }

    let mut guard = REGISTRY.write().unwrap();
    if DISPATCHER_INSTALLED.load(Ordering::Acquire) {
        return Ok(());
    }
    guard.get_or_insert_with(VehRegistry::default);

    // SAFETY: dispatcher stays valid for the process lifetime, the handler
    // is never removed
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(dispatcher)) };
    if handle.is_null() {
        return Err(SpecterError::ExceptionHandlerInstall {
            code: SpecterError::last_error(),
        });
    }

    DISPATCHER_INSTALLED.store(true, Ordering::Release);
    Ok(())
}

/// breakpoint redirection: register, then write the `0xCC`
pub(crate) fn install_breakpoint(process: &Process, target: usize, detour: usize) -> Result<()> {
    {
        let mut guard = REGISTRY.write().unwrap();
        let registry = guard.get_or_insert_with(VehRegistry::default);
        if registry.hooks.contains_key(&target) {
            return Err(SpecterError::DuplicateHook { target });
        }
        registry.hooks.insert(target, detour);
    }

    tracing::debug!(address = target, "writing breakpoint");
    if let Err(err) = process.write_bytes(target, &[0xCC]) {
        // roll the registration back so the invariant holds
        let mut guard = REGISTRY.write().unwrap();
        if let Some(registry) = guard.as_mut() {
            registry.hooks.remove(&target);
        }
        return Err(err);
    }

    Ok(())
}

/// breakpoint removal: restore the byte, then unregister
pub(crate) fn remove_breakpoint(process: &Process, target: usize, orig: &[u8]) -> Result<()> {
    process.write_bytes(target, orig)?;

    let mut guard = REGISTRY.write().unwrap();
    if let Some(registry) = guard.as_mut() {
        registry.hooks.remove(&target);
    }
    Ok(())
}

/// debug-register redirection for the calling thread
pub(crate) fn install_debug_register(target: usize, detour: usize) -> Result<()> {
    let mut guard = REGISTRY.write().unwrap();
    let registry = guard.get_or_insert_with(VehRegistry::default);

    if registry.hooks.contains_key(&target) {
        return Err(SpecterError::DuplicateHook { target });
    }

    let tid = current_thread_id();
    if registry.dr_hooks.contains_key(&tid) {
        // one hardware hook per thread
        return Err(SpecterError::DuplicateHook { target });
    }

    let thread = Thread::current();
    let mut context = thread.context(CONTEXT_DEBUG_REGISTERS)?;

    let mut dr_index = None;
    for index in 0..4u32 {
        let control_clear = context.dr7() & (1usize << (index * 2)) == 0;
        // a non-zero register with a clear enable bit may still belong to
        // someone; leave it alone
        let register_clear = context.dr(index) == 0;
        if control_clear && register_clear {
            dr_index = Some(index);
            break;
        }
    }
    let Some(index) = dr_index else {
        return Err(SpecterError::NoFreeDebugRegister);
    };

    tracing::debug!(address = target, index, tid, "arming debug register");

    context.set_dr(index, target);
    let mut dr7 = context.dr7();
    // local enable for the chosen register
    dr7 |= 1usize << (index * 2);
    // RW field: break on execution
    let break_type = 0usize;
    dr7 |= break_type << (16 + 4 * index);
    // LEN field: one byte
    let break_len = 0usize;
    dr7 |= break_len << (18 + 4 * index);
    // local-exact flag
    dr7 |= 1usize << 8;
    context.set_dr7(dr7);

    thread.set_context(&context)?;

    registry.hooks.insert(target, detour);
    registry.dr_hooks.insert(tid, index);
    Ok(())
}

/// disarm the calling thread's debug register and unregister
pub(crate) fn remove_debug_register(target: usize) -> Result<()> {
    let mut guard = REGISTRY.write().unwrap();
    let Some(registry) = guard.as_mut() else {
        return Ok(());
    };

    let tid = current_thread_id();
    let index = match registry.dr_hooks.get(&tid) {
        Some(&index) => index,
        None => {
            // remove() ran on a thread other than the one that applied
            tracing::warn!(address = target, tid, "no debug-register record for this thread");
            registry.hooks.remove(&target);
            return Ok(());
        }
    };

    tracing::debug!(address = target, index, tid, "disarming debug register");

    let thread = Thread::current();
    let mut context = thread.context(CONTEXT_DEBUG_REGISTERS)?;
    context.set_dr(index, 0);
    context.set_dr7(context.dr7() & !(1usize << (index * 2)));
    thread.set_context(&context)?;

    registry.dr_hooks.remove(&tid);
    registry.hooks.remove(&target);
    Ok(())
}

/// the process-wide vectored handler
extern "system" fn dispatcher(pointers: *mut ExceptionPointers) -> i32 {
    if pointers.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // SAFETY: the OS guarantees both records are valid during dispatch
    let (record, context) = unsafe {
        let info = &*pointers;
        (&*info.exception_record, &mut *info.context_record)
    };

    match record.exception_code {
        EXCEPTION_BREAKPOINT => handle_breakpoint(record, context),
        EXCEPTION_SINGLE_STEP => handle_single_step(record, context),
        _ => EXCEPTION_CONTINUE_SEARCH,
    }
}

fn handle_breakpoint(record: &ExceptionRecord, context: &mut Context) -> i32 {
    let Ok(guard) = REGISTRY.read() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let Some(registry) = guard.as_ref() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    match registry.hooks.get(&(record.exception_address as usize)) {
        Some(&detour) => {
            // the detour replays or skips the covered instruction itself and
            // reaches the original through the trampoline
            context.set_pc(detour);
            EXCEPTION_CONTINUE_EXECUTION
        }
        None => EXCEPTION_CONTINUE_SEARCH,
    }
}

fn handle_single_step(record: &ExceptionRecord, context: &mut Context) -> i32 {
    let Ok(guard) = REGISTRY.read() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let Some(registry) = guard.as_ref() else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    let Some(&detour) = registry.hooks.get(&(record.exception_address as usize)) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    let Some(&index) = registry.dr_hooks.get(&current_thread_id()) else {
        return EXCEPTION_CONTINUE_SEARCH;
    };
    if context.dr6() & (1usize << index) == 0 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    context.set_dr6(0);
    // resume flag keeps the breakpoint from refiring on continue
    context.set_eflags(context.eflags() | 1 << 16);
    context.set_pc(detour);
    EXCEPTION_CONTINUE_EXECUTION
}

#[repr(C)]
struct ExceptionRecord {
    exception_code: u32,
    exception_flags: u32,
    exception_record: *mut ExceptionRecord,
    exception_address: *mut core::ffi::c_void,
    number_parameters: u32,
    exception_information: [usize; 15],
}

#[repr(C)]
struct ExceptionPointers {
    exception_record: *mut ExceptionRecord,
    context_record: *mut Context,
}

type VectoredHandler = Option<extern "system" fn(*mut ExceptionPointers) -> i32>;

#[link(name = "kernel32")]
extern "system" {
    fn AddVectoredExceptionHandler(first: u32, handler: VectoredHandler) -> *mut core::ffi::c_void;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::test_util::{call_u32, exec_page, mov_eax_ret, serialize};

    fn hook_pair(process: &Process) -> (crate::alloc::Allocation, usize, usize) {
        let (page, target) = exec_page(process, &mov_eax_ret(0x1122_3344));
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0xAABB_CCDD)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();
        (page, target, detour)
    }

    #[test]
    fn test_breakpoint_dispatch() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, target, detour) = hook_pair(&process);

        let mut patch = BreakpointPatch::new(&process, target, detour).unwrap();
        patch.apply().expect("apply should succeed");

        assert_eq!(process.read_bytes(target, 1).unwrap(), [0xCC]);
        assert_eq!(call_u32(target), 0xAABB_CCDD);
        assert_eq!(call_u32(patch.trampoline_ptr().unwrap()), 0x1122_3344);

        patch.remove().expect("remove should succeed");
        assert_eq!(process.read_bytes(target, 1).unwrap(), [0xB8]);
        assert_eq!(call_u32(target), 0x1122_3344);
    }

    #[test]
    fn test_breakpoint_collision() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, target, detour) = hook_pair(&process);

        let mut first = BreakpointPatch::new(&process, target, detour).unwrap();
        first.apply().unwrap();

        let mut second = BreakpointPatch::new(&process, target, detour).unwrap();
        let err = second.apply().expect_err("second apply must collide");
        assert!(matches!(err, SpecterError::DuplicateHook { .. }));
        assert!(!second.is_applied());

        // the first hook keeps working
        assert_eq!(call_u32(target), 0xAABB_CCDD);
        first.remove().unwrap();
    }

    #[test]
    fn test_breakpoint_cannot_chain() {
        let process = Process::current();
        let patch = BreakpointPatch::new(&process, 0x1000, 0x2000).unwrap();
        assert!(!patch.can_hook_chain());
    }

    #[test]
    fn test_registry_tracks_applied_state() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, target, detour) = hook_pair(&process);

        let mut patch = BreakpointPatch::new(&process, target, detour).unwrap();
        patch.apply().unwrap();
        {
            let guard = REGISTRY.read().unwrap();
            let registry = guard.as_ref().unwrap();
            assert_eq!(registry.hooks.get(&target), Some(&detour));
        }

        patch.remove().unwrap();
        {
            let guard = REGISTRY.read().unwrap();
            let registry = guard.as_ref().unwrap();
            assert!(!registry.hooks.contains_key(&target));
        }
    }

    #[test]
    fn test_debug_register_roundtrip() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, target, detour) = hook_pair(&process);

        let mut patch = DebugRegisterPatch::new(&process, target, detour).unwrap();
        if let Err(err) = patch.apply() {
            // a debugger may already own every register
            assert!(matches!(err, SpecterError::NoFreeDebugRegister));
            return;
        }

        // the prologue is untouched, only the debug register redirects
        assert_eq!(process.read_bytes(target, 1).unwrap(), [0xB8]);
        assert_eq!(call_u32(target), 0xAABB_CCDD);
        assert_eq!(call_u32(patch.trampoline_ptr().unwrap()), 0x1122_3344);

        patch.remove().expect("remove should succeed");
        assert_eq!(call_u32(target), 0x1122_3344);
    }

    #[test]
    fn test_debug_register_one_hook_per_thread() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, target, detour) = hook_pair(&process);
        let (_page2, target2, detour2) = hook_pair(&process);

        let mut first = DebugRegisterPatch::new(&process, target, detour).unwrap();
        if first.apply().is_err() {
            return;
        }

        let mut second = DebugRegisterPatch::new(&process, target2, detour2).unwrap();
        let err = second.apply().expect_err("one hardware hook per thread");
        assert!(matches!(err, SpecterError::DuplicateHook { .. }));

        first.remove().unwrap();
    }
}
