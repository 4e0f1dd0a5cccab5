#![cfg(windows)]
#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)] // we document safety in SAFETY comments

//! specter: function hooking and code patching for Windows x86/x64
//!
//! This library installs, maintains and removes redirections of native
//! functions. A hooked function transfers control to a caller-supplied
//! detour; the original stays reachable through a generated trampoline.
//!
//! # Patch kinds
//!
//! - [`RawPatch`]: overwrite N bytes and restore them on remove
//! - [`DetourPatch`]: rewrite the prologue with a jump, relocating the
//!   displaced instructions into a trampoline
//! - [`BreakpointPatch`]: plant a single `0xCC` and redirect from the
//!   vectored exception handler
//! - [`DebugRegisterPatch`]: arm a hardware execute breakpoint, leaving the
//!   target bytes untouched
//!
//! All kinds share one thread-safety protocol: every other thread of the
//! target process is suspended for the duration of apply/remove, and the
//! mutation is refused with `BusyTarget` if a suspended thread is mid-flight
//! in the affected bytes.
//!
//! # Example
//!
//! ```ignore
//! use specter::{DetourPatch, Process};
//!
//! type TargetFn = extern "system" fn(i32) -> i32;
//!
//! extern "system" fn my_detour(x: i32) -> i32 {
//!     // call the original through the trampoline
//!     unsafe { ORIGINAL.unwrap()(x) + 1 }
//! }
//!
//! static mut ORIGINAL: Option<TargetFn> = None;
//!
//! let process = Process::current();
//! let mut patch = DetourPatch::new(&process, target_addr, my_detour as usize);
//! patch.apply()?;
//! unsafe {
//!     ORIGINAL = Some(std::mem::transmute(patch.trampoline_ptr().unwrap()));
//! }
//! ```
//!
//! # Feature flags
//!
//! - `veh` (default): breakpoint and debug-register strategies plus the
//!   exception dispatcher
//! - `shim` (default): `CreateProcessInternalW` spawn-shim support
//!
//! # Notes
//!
//! Apply and remove freeze every other thread of the process. The test suite
//! exercises real hooks in-process and should be run with
//! `--test-threads=1` if tests are added that allocate heavily while others
//! patch.

pub mod alloc;
pub mod decode;
pub mod error;
pub mod patch;
pub mod process;
#[cfg(feature = "shim")]
pub mod shim;
pub mod thread;

// re-exports for convenience
pub use error::{Result, SpecterError};
#[cfg(feature = "veh")]
pub use patch::{BreakpointPatch, DebugRegisterPatch};
pub use patch::{DetourPatch, RawPatch, RedirectKind};
pub use process::Process;

/// library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
