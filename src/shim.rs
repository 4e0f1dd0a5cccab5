//! Cross-bitness spawn shim
//!
//! Detours a `CreateProcessInternalW`-shaped function so every child process
//! is created suspended, handed to an injector, and only then resumed. The
//! injector itself is supplied by the caller; this module owns the detour
//! discipline around it:
//!
//! - last-error transparency: the hooked caller observes the last-error code
//!   the original produced, not whatever the injection work set
//! - forced suspend: the child cannot execute before injection finishes
//! - deterministic resume: the thread is resumed on every exit path
//! - recursion protection: a cross-bitness injector spawns a helper process,
//!   which must pass through uninstrumented
//!
//! The same RAII pieces ([`DetourRefGuard`], [`LastErrorPreserver`],
//! [`RecursionProtector`], [`ResumeThreadGuard`]) are exported for hand
//! written detours that need the idiom.

use crate::error::{Result, SpecterError};
use crate::patch::DetourPatch;
use crate::process::Process;
use core::cell::Cell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

const CREATE_SUSPENDED: u32 = 0x0000_0004;

/// RAII increment of a detour's user-visible reference counter
pub struct DetourRefGuard<'a> {
    count: &'a AtomicU32,
}

impl<'a> DetourRefGuard<'a> {
    /// increment on entry to a detour body
    pub fn new(count: &'a AtomicU32) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count }
    }
}

impl Drop for DetourRefGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// keeps the hooked caller's last-error view consistent
///
/// capture on entry, `revert` just before calling the original, `update`
/// right after; the drop at scope end restores the captured code across any
/// work the detour did afterwards.
pub struct LastErrorPreserver {
    last_error: u32,
}

impl LastErrorPreserver {
    /// capture the current last-error code
    pub fn new() -> Self {
        // SAFETY: GetLastError is always safe to call
        Self {
            last_error: unsafe { GetLastError() },
        }
    }

    /// put the captured code back
    pub fn revert(&self) {
        // SAFETY: SetLastError is always safe to call
        unsafe { SetLastError(self.last_error) }
    }

    /// capture the code the last call produced
    pub fn update(&mut self) {
        // SAFETY: GetLastError is always safe to call
        self.last_error = unsafe { GetLastError() };
    }
}

impl Default for LastErrorPreserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LastErrorPreserver {
    fn drop(&mut self) {
        // SAFETY: SetLastError is always safe to call
        unsafe { SetLastError(self.last_error) }
    }
}

/// thread-local re-entrancy flag held for a scope
pub struct RecursionProtector {
    key: &'static std::thread::LocalKey<Cell<bool>>,
}

impl RecursionProtector {
    /// set the flag for this thread; `None` when it is already set
    pub fn enter(key: &'static std::thread::LocalKey<Cell<bool>>) -> Option<Self> {
        if key.with(|flag| flag.replace(true)) {
            None
        } else {
            Some(Self { key })
        }
    }
}

impl Drop for RecursionProtector {
    fn drop(&mut self) {
        self.key.with(|flag| flag.set(false));
    }
}

/// resumes a thread on scope exit
pub struct ResumeThreadGuard {
    thread: *mut core::ffi::c_void,
}

impl ResumeThreadGuard {
    /// resume `thread` when the guard drops
    pub fn new(thread: *mut core::ffi::c_void) -> Self {
        Self { thread }
    }
}

impl Drop for ResumeThreadGuard {
    fn drop(&mut self) {
        // SAFETY: the handle stays valid while the guard lives
        if unsafe { ResumeThread(self.thread) } == u32::MAX {
            tracing::error!("failed to resume spawned thread");
        }
    }
}

/// PROCESS_INFORMATION as filled by process creation
#[repr(C)]
pub struct ProcessInformation {
    pub process: *mut core::ffi::c_void,
    pub thread: *mut core::ffi::c_void,
    pub process_id: u32,
    pub thread_id: u32,
}

/// `CreateProcessInternalW` signature
pub type CreateProcessInternalWFn = unsafe extern "system" fn(
    token: *mut core::ffi::c_void,
    application_name: *const u16,
    command_line: *mut u16,
    process_attributes: *mut core::ffi::c_void,
    thread_attributes: *mut core::ffi::c_void,
    inherit_handles: i32,
    creation_flags: u32,
    environment: *mut core::ffi::c_void,
    current_directory: *const u16,
    startup_info: *mut core::ffi::c_void,
    process_information: *mut ProcessInformation,
    new_token: *mut *mut core::ffi::c_void,
) -> i32;

/// performs the actual DLL injection into a freshly spawned child
pub trait SpawnInjector: Send + Sync {
    /// child has the same bitness as this process; inject directly
    fn inject(&self, child: &Process) -> Result<()>;

    /// child has the other bitness; delegate to a same-bitness helper
    fn inject_cross(&self, child: &Process) -> Result<()>;
}

struct SpawnShim {
    patch: DetourPatch<'static>,
    injector: Arc<dyn SpawnInjector>,
}

static SELF_PROCESS: OnceLock<Process> = OnceLock::new();
static SPAWN_SHIM: Mutex<Option<SpawnShim>> = Mutex::new(None);

thread_local! {
    static IN_SPAWN_HOOK: Cell<bool> = Cell::new(false);
}

/// detour `CreateProcessInternalW` at `target` and route children through
/// `injector`
pub fn install_spawn_shim(target: usize, injector: Arc<dyn SpawnInjector>) -> Result<()> {
    let process = SELF_PROCESS.get_or_init(Process::current);

    let mut guard = SPAWN_SHIM.lock().unwrap();
    if guard.is_some() {
        return Err(SpecterError::DuplicateHook { target });
    }

    let shim = guard.insert(SpawnShim {
        patch: DetourPatch::new(process, target, spawn_detour as usize),
        injector,
    });

    if let Err(err) = shim.patch.apply() {
        *guard = None;
        return Err(err);
    }

    Ok(())
}

/// restore the original spawn path and drain in-flight detour bodies
///
/// the shim entry itself stays alive: callers that entered the detour before
/// the restore still reach the original through the (never freed) trampoline.
pub fn remove_spawn_shim() -> Result<()> {
    let mut guard = SPAWN_SHIM.lock().unwrap();
    let Some(shim) = guard.as_mut() else {
        return Ok(());
    };

    shim.patch.remove()?;

    while shim.patch.ref_count().load(Ordering::Acquire) != 0 {
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    Ok(())
}

fn shim_state() -> Option<(CreateProcessInternalWFn, *const AtomicU32, Arc<dyn SpawnInjector>)> {
    let guard = SPAWN_SHIM.lock().unwrap();
    let shim = guard.as_ref()?;
    let trampoline = shim.patch.trampoline_ptr()?;

    // SAFETY: the trampoline replays the original prologue and matches the
    // hooked function's signature
    let original = unsafe { core::mem::transmute::<usize, CreateProcessInternalWFn>(trampoline) };
    Some((
        original,
        shim.patch.ref_count() as *const AtomicU32,
        Arc::clone(&shim.injector),
    ))
}

unsafe extern "system" fn spawn_detour(
    token: *mut core::ffi::c_void,
    application_name: *const u16,
    command_line: *mut u16,
    process_attributes: *mut core::ffi::c_void,
    thread_attributes: *mut core::ffi::c_void,
    inherit_handles: i32,
    creation_flags: u32,
    environment: *mut core::ffi::c_void,
    current_directory: *const u16,
    startup_info: *mut core::ffi::c_void,
    process_information: *mut ProcessInformation,
    new_token: *mut *mut core::ffi::c_void,
) -> i32 {
    let Some((original, ref_count, injector)) = shim_state() else {
        // unreachable once installed; the patch is applied only after the
        // shim entry exists
        return 0;
    };

    // SAFETY: the counter lives in the shim entry, which is never dropped
    let _ref_guard = DetourRefGuard::new(unsafe { &*ref_count });
    let mut last_error = LastErrorPreserver::new();

    tracing::trace!(creation_flags, "spawn intercepted");

    // the child must not run a single instruction before injection
    last_error.revert();
    let ret = unsafe {
        original(
            token,
            application_name,
            command_line,
            process_attributes,
            thread_attributes,
            inherit_handles,
            creation_flags | CREATE_SUSPENDED,
            environment,
            current_directory,
            startup_info,
            process_information,
            new_token,
        )
    };
    last_error.update();

    if process_information.is_null() {
        return ret;
    }

    // resume on every exit path below, unless the caller wanted suspension
    let _resume = if ret != 0 && creation_flags & CREATE_SUSPENDED == 0 {
        // SAFETY: on success the OS filled process_information
        Some(ResumeThreadGuard::new(unsafe { (*process_information).thread }))
    } else {
        None
    };

    // a cross-bitness injector spawns a helper process of its own; that
    // spawn must pass through uninstrumented
    let Some(_recursion) = RecursionProtector::enter(&IN_SPAWN_HOOK) else {
        tracing::trace!("recursive spawn, passing through");
        return ret;
    };

    if ret == 0 {
        return ret;
    }

    // SAFETY: handles in process_information are live on success
    let child = unsafe {
        Process::from_raw_handle(
            (*process_information).process as usize,
            (*process_information).process_id,
        )
    };

    if let Err(err) = dispatch_injection(&child, injector.as_ref()) {
        // injection failures never surface to the hooked caller
        tracing::error!(error = %err, pid = child.pid(), "injection into spawned child failed");
    }

    ret
}

fn dispatch_injection(child: &Process, injector: &dyn SpawnInjector) -> Result<()> {
    let parent = SELF_PROCESS.get_or_init(Process::current);
    if parent.is_wow64()? != child.is_wow64()? {
        tracing::debug!(pid = child.pid(), "bitness mismatch, delegating injection");
        injector.inject_cross(child)
    } else {
        injector.inject(child)
    }
}

#[link(name = "kernel32")]
extern "system" {
    fn GetLastError() -> u32;
    fn SetLastError(code: u32);
    fn ResumeThread(thread: *mut core::ffi::c_void) -> u32;
}
