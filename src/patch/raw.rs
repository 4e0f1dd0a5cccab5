//! Raw byte patch
//!
//! Overwrites a byte range and restores it on remove. No disassembly, no
//! trampoline; what this kind contributes is the freeze-and-verify protocol
//! that all patches share.

use crate::error::Result;
use crate::process::Process;
use crate::thread::{verify_threads_not_executing, FreezeGuard};

/// write-N-bytes patch with restore
pub struct RawPatch<'a> {
    process: &'a Process,
    target: usize,
    data: Vec<u8>,
    orig: Vec<u8>,
    applied: bool,
    detached: bool,
}

impl<'a> RawPatch<'a> {
    /// record a write plan; nothing is touched until `apply`
    pub fn new(process: &'a Process, target: usize, data: Vec<u8>) -> Self {
        Self {
            process,
            target,
            data,
            orig: Vec::new(),
            applied: false,
            detached: false,
        }
    }

    /// whether the patch is currently installed
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// write the new bytes, saving the previous ones
    pub fn apply(&mut self) -> Result<()> {
        if self.applied || self.detached {
            return Ok(());
        }

        let _frozen = FreezeGuard::freeze(self.process.pid())?;

        verify_threads_not_executing(
            self.process.pid(),
            &[(self.target, self.target + self.data.len())],
        )?;

        self.orig = self.process.read_bytes(self.target, self.data.len())?;
        self.process.write_bytes(self.target, &self.data)?;
        self.process
            .flush_instruction_cache(self.target, self.data.len())?;

        tracing::debug!(address = self.target, len = self.data.len(), "raw patch applied");

        self.applied = true;
        Ok(())
    }

    /// restore the saved bytes
    pub fn remove(&mut self) -> Result<()> {
        if !self.applied {
            return Ok(());
        }

        let _frozen = FreezeGuard::freeze(self.process.pid())?;

        verify_threads_not_executing(
            self.process.pid(),
            &[(self.target, self.target + self.data.len())],
        )?;

        self.process.write_bytes(self.target, &self.orig)?;
        self.process
            .flush_instruction_cache(self.target, self.orig.len())?;

        tracing::debug!(address = self.target, "raw patch removed");

        self.applied = false;
        Ok(())
    }

    /// mark the patch inert forever; apply and remove become no-ops
    pub fn detach(&mut self) {
        self.applied = false;
        self.detached = true;
    }

    fn remove_unchecked(&mut self) {
        if let Err(err) = self.remove() {
            // the target stays patched; all we can do is record it and let
            // destruction finish
            tracing::error!(address = self.target, error = %err, "raw patch not removed");
            self.applied = false;
            self.data.clear();
            self.orig.clear();
        }
    }
}

impl Drop for RawPatch<'_> {
    fn drop(&mut self) {
        self.remove_unchecked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SpecterError;
    use crate::patch::test_util::{exec_page, serialize};

    #[test]
    fn test_apply_restores_roundtrip() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, addr) = exec_page(&process, &[0x11, 0x22, 0x33, 0x44]);

        let mut patch = RawPatch::new(&process, addr, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(!patch.is_applied());

        patch.apply().expect("apply should succeed");
        assert!(patch.is_applied());
        assert_eq!(
            process.read_bytes(addr, 4).unwrap(),
            [0xAA, 0xBB, 0xCC, 0xDD]
        );

        patch.remove().expect("remove should succeed");
        assert!(!patch.is_applied());
        assert_eq!(
            process.read_bytes(addr, 4).unwrap(),
            [0x11, 0x22, 0x33, 0x44]
        );
    }

    #[test]
    fn test_apply_and_remove_are_idempotent() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, addr) = exec_page(&process, &[0x90, 0x90]);

        let mut patch = RawPatch::new(&process, addr, vec![0xCC, 0xCC]);
        patch.apply().unwrap();
        patch.apply().unwrap();
        assert_eq!(process.read_bytes(addr, 2).unwrap(), [0xCC, 0xCC]);

        patch.remove().unwrap();
        patch.remove().unwrap();
        assert_eq!(process.read_bytes(addr, 2).unwrap(), [0x90, 0x90]);
    }

    #[test]
    fn test_detached_patch_is_inert() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, addr) = exec_page(&process, &[0x90, 0x90]);

        let mut patch = RawPatch::new(&process, addr, vec![0xCC, 0xCC]);
        patch.detach();
        patch.apply().unwrap();
        assert!(!patch.is_applied());
        assert_eq!(process.read_bytes(addr, 2).unwrap(), [0x90, 0x90]);
    }

    #[test]
    fn test_drop_restores_target() {
        let _serial = serialize();
        let process = Process::current();
        let (_page, addr) = exec_page(&process, &[0x11, 0x22]);

        {
            let mut patch = RawPatch::new(&process, addr, vec![0xAA, 0xBB]);
            patch.apply().unwrap();
        }

        assert_eq!(process.read_bytes(addr, 2).unwrap(), [0x11, 0x22]);
    }

    #[test]
    fn test_busy_target_refused() {
        let _serial = serialize();
        let process = Process::current();
        // jmp $ parks a worker inside the range; C3 lets it leave once the
        // spin is overwritten
        let (_page, addr) = exec_page(&process, &[0xEB, 0xFE, 0xC3]);

        let worker = std::thread::spawn(move || {
            let f: extern "C" fn() = unsafe { core::mem::transmute(addr) };
            f();
        });
        std::thread::sleep(std::time::Duration::from_millis(100));

        let mut patch = RawPatch::new(&process, addr, vec![0x90, 0x90]);
        let err = patch.apply().expect_err("apply must refuse a busy target");
        assert!(matches!(err, SpecterError::BusyTarget { .. }));
        assert!(!patch.is_applied());
        assert_eq!(process.read_bytes(addr, 2).unwrap(), [0xEB, 0xFE]);

        // free the worker
        process.write_bytes(addr, &[0x90, 0x90]).unwrap();
        process.flush_instruction_cache(addr, 2).unwrap();
        worker.join().unwrap();
    }
}
