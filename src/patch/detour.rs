//! Detour patch
//!
//! Rewrites a function prologue with a redirection to the detour and builds a
//! trampoline holding the relocated prologue, so the original stays callable
//! while the hook is live.

#[cfg(target_arch = "x86_64")]
use crate::alloc::allocate_page_near;
use crate::alloc::Allocation;
use crate::decode::{InstructionDecoder, Transfer};
use crate::error::{Result, SpecterError};
use crate::process::Process;
use crate::thread::{verify_threads_not_executing, FreezeGuard};
use std::sync::atomic::AtomicU32;

const MAX_INSTRUCTION_LEN: usize = 15;
const TRAMPOLINE_SIZE: usize = MAX_INSTRUCTION_LEN * 3;

const JMP_REL32_SIZE: usize = 5;
#[cfg(target_arch = "x86_64")]
const JMP_INDIRECT_SIZE: usize = 6;

/// how the redirection at the patch site is expressed
///
/// the apply/remove orchestration is shared; the kind picks the patch size
/// and the install/uninstall of the redirection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// overwrite the prologue with a jump to the detour
    Jump,
    /// single 0xCC dispatched through the exception handler
    #[cfg(feature = "veh")]
    Breakpoint,
    /// hardware execute breakpoint; the prologue is left untouched
    #[cfg(feature = "veh")]
    DebugRegister,
}

/// prologue-rewriting patch with a trampoline to the original
pub struct DetourPatch<'a> {
    process: &'a Process,
    target: usize,
    detour: usize,
    kind: RedirectKind,
    /// trampoline of the current or previous cycle
    ///
    /// Never freed in `remove`: a thread that left the patched region just
    /// before the restore may still be running the trampoline tail. The
    /// allocation is released at the start of the next `apply`, or on drop.
    trampoline: Option<Allocation>,
    /// jump islands created while relocating the prologue; same lifetime
    /// rule as the trampoline
    islands: Vec<Allocation>,
    orig: Vec<u8>,
    applied: bool,
    detached: bool,
    /// incremented/decremented by the detour body, never by the engine;
    /// operators drain it to zero after `remove` before unloading code
    ref_count: AtomicU32,
}

impl<'a> DetourPatch<'a> {
    /// record a detour plan; nothing is touched until `apply`
    pub fn new(process: &'a Process, target: usize, detour: usize) -> Self {
        Self::with_kind(process, target, detour, RedirectKind::Jump)
    }

    pub(crate) fn with_kind(
        process: &'a Process,
        target: usize,
        detour: usize,
        kind: RedirectKind,
    ) -> Self {
        Self {
            process,
            target,
            detour,
            kind,
            trampoline: None,
            islands: Vec::new(),
            orig: Vec::new(),
            applied: false,
            detached: false,
            ref_count: AtomicU32::new(0),
        }
    }

    /// whether the patch is currently installed
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// address of the hooked function
    pub fn target(&self) -> usize {
        self.target
    }

    /// address of the replacement function
    pub fn detour(&self) -> usize {
        self.detour
    }

    /// entry point of the relocated original; call this instead of `target`
    /// while the patch is applied
    pub fn trampoline_ptr(&self) -> Option<usize> {
        self.trampoline.as_ref().map(|t| t.base())
    }

    /// the user-managed reference counter
    pub fn ref_count(&self) -> &AtomicU32 {
        &self.ref_count
    }

    /// whether another detour can be stacked on the same target
    pub fn can_hook_chain(&self) -> bool {
        match self.kind {
            RedirectKind::Jump => true,
            #[cfg(feature = "veh")]
            RedirectKind::Breakpoint | RedirectKind::DebugRegister => false,
        }
    }

    /// build the trampoline and install the redirection
    pub fn apply(&mut self) -> Result<()> {
        if self.applied || self.detached {
            return Ok(());
        }

        // release the previous cycle's trampoline and islands; doing it here
        // instead of in remove() keeps them valid for threads that were
        // still draining through them (see the field note)
        self.trampoline = None;
        self.islands.clear();

        let _frozen = FreezeGuard::freeze(self.process.pid())?;

        let result = self.build_and_install();
        if result.is_err() {
            self.trampoline = None;
            self.islands.clear();
            self.orig.clear();
        }
        result?;

        self.applied = true;
        Ok(())
    }

    fn build_and_install(&mut self) -> Result<()> {
        let patch_size = self.plan_patch_size();

        let trampoline = Allocation::new(self.process, TRAMPOLINE_SIZE)?;
        let tramp_base = trampoline.base();
        tracing::debug!(
            address = self.target,
            detour = self.detour,
            trampoline = tramp_base,
            patch_size,
            "building trampoline"
        );
        self.trampoline = Some(trampoline);

        let buffer = self.process.read_bytes(self.target, TRAMPOLINE_SIZE)?;
        let decoder = InstructionDecoder::native();

        let mut tramp_cur = tramp_base;
        let mut consumed = 0usize;

        while consumed < patch_size {
            let address = self.target + consumed;
            let decoded = decoder
                .decode_at(address, &buffer[consumed..])
                .ok_or(SpecterError::Disasm { address })?;
            let len = decoded.length();

            match decoded.transfer() {
                Transfer::DirectJump { dest } => {
                    tracing::trace!(address, dest, "relocating direct jump");
                    tramp_cur += self.write_jump(tramp_cur, dest as usize, false)?;
                }
                Transfer::DirectCall { dest } => {
                    tracing::trace!(address, dest, "relocating direct call");
                    tramp_cur += self.write_call(tramp_cur, dest as usize)?;
                }
                Transfer::RipIndirectJump { slot } => {
                    // a prior detour's patch; chase the pointer it reads so
                    // the chain stays intact
                    let dest: u64 = self.process.read_value(slot as usize)?;
                    tracing::trace!(address, dest, "resolving chained indirect jump");
                    tramp_cur += self.write_jump(tramp_cur, dest as usize, false)?;
                }
                Transfer::Plain => {
                    self.process
                        .write_bytes(tramp_cur, &buffer[consumed..consumed + len])?;
                    tramp_cur += len;
                }
            }

            consumed += len;
        }

        // jump back to the first instruction the patch did not consume
        self.write_jump(tramp_cur, self.target + consumed, true)?;
        self.process
            .flush_instruction_cache(tramp_base, TRAMPOLINE_SIZE)?;

        self.orig = self.process.read_bytes(self.target, patch_size)?;

        verify_threads_not_executing(
            self.process.pid(),
            &[(self.target, self.target + self.orig.len())],
        )?;

        self.install_redirection()?;
        self.process.flush_instruction_cache(self.target, consumed)?;
        Ok(())
    }

    /// restore the original prologue
    pub fn remove(&mut self) -> Result<()> {
        if !self.applied {
            return Ok(());
        }

        let _frozen = FreezeGuard::freeze(self.process.pid())?;

        let mut ranges = vec![(self.target, self.target + self.orig.len())];
        if let Some(trampoline) = &self.trampoline {
            // a thread inside the trampoline is on its way back into the
            // original function; restoring now would strand it
            ranges.push((trampoline.base(), trampoline.base() + trampoline.size()));
        }
        verify_threads_not_executing(self.process.pid(), &ranges)?;

        self.uninstall_redirection()?;
        self.process
            .flush_instruction_cache(self.target, self.orig.len())?;

        tracing::debug!(address = self.target, "detour removed");

        // the trampoline stays allocated; see the field note
        self.applied = false;
        Ok(())
    }

    /// mark the patch inert forever; apply and remove become no-ops
    pub fn detach(&mut self) {
        self.applied = false;
        self.detached = true;
    }

    fn plan_patch_size(&self) -> usize {
        match self.kind {
            RedirectKind::Jump => jump_patch_size(self.target, self.detour),
            #[cfg(feature = "veh")]
            RedirectKind::Breakpoint | RedirectKind::DebugRegister => 1,
        }
    }

    fn install_redirection(&mut self) -> Result<()> {
        match self.kind {
            RedirectKind::Jump => {
                self.write_jump(self.target, self.detour, false)?;
                Ok(())
            }
            #[cfg(feature = "veh")]
            RedirectKind::Breakpoint => {
                super::veh::install_breakpoint(self.process, self.target, self.detour)
            }
            #[cfg(feature = "veh")]
            RedirectKind::DebugRegister => {
                super::veh::install_debug_register(self.target, self.detour)
            }
        }
    }

    fn uninstall_redirection(&mut self) -> Result<()> {
        match self.kind {
            RedirectKind::Jump => self.process.write_bytes(self.target, &self.orig),
            #[cfg(feature = "veh")]
            RedirectKind::Breakpoint => {
                super::veh::remove_breakpoint(self.process, self.target, &self.orig)
            }
            #[cfg(feature = "veh")]
            RedirectKind::DebugRegister => super::veh::remove_debug_register(self.target),
        }
    }

    /// emit an unconditional transfer from `from` to `to`
    ///
    /// `allow_push_ret` admits the push/ret form, which transiently clobbers
    /// the word below the stack pointer; only the trampoline tail jump may
    /// use it.
    #[cfg(target_arch = "x86_64")]
    fn write_jump(&mut self, from: usize, to: usize, allow_push_ret: bool) -> Result<usize> {
        if is_near(from, to) {
            let buf = encode_jmp_rel32(from, to);
            self.process.write_bytes(from, &buf)?;
            return Ok(buf.len());
        }

        match allocate_page_near(self.process, from) {
            Ok(island) => {
                tracing::trace!(from, to, island = island.base(), "indirect jump via island");
                self.process.write_value(island.base(), &(to as u64))?;
                let buf = encode_jmp_indirect(from, island.base());
                self.process.write_bytes(from, &buf)?;
                self.islands.push(island);
                Ok(buf.len())
            }
            Err(_) if allow_push_ret => {
                tracing::trace!(from, to, "push/ret jump");
                let buf = if to >> 32 == 0 {
                    encode_push_ret32(to)
                } else {
                    encode_push_ret64(to)
                };
                self.process.write_bytes(from, &buf)?;
                Ok(buf.len())
            }
            Err(_) => Err(SpecterError::UnreachableTarget { from, to }),
        }
    }

    #[cfg(target_arch = "x86")]
    fn write_jump(&mut self, from: usize, to: usize, _allow_push_ret: bool) -> Result<usize> {
        let buf = encode_jmp_rel32(from, to);
        self.process.write_bytes(from, &buf)?;
        Ok(buf.len())
    }

    /// emit a call from `from` to `to`; on x64 always through a near page
    #[cfg(target_arch = "x86_64")]
    fn write_call(&mut self, from: usize, to: usize) -> Result<usize> {
        let island = allocate_page_near(self.process, from)
            .map_err(|_| SpecterError::UnreachableTarget { from, to })?;
        tracing::trace!(from, to, island = island.base(), "indirect call via island");
        self.process.write_value(island.base(), &(to as u64))?;
        let buf = encode_call_indirect(from, island.base());
        self.process.write_bytes(from, &buf)?;
        self.islands.push(island);
        Ok(buf.len())
    }

    #[cfg(target_arch = "x86")]
    fn write_call(&mut self, from: usize, to: usize) -> Result<usize> {
        let buf = encode_call_rel32(from, to);
        self.process.write_bytes(from, &buf)?;
        Ok(buf.len())
    }

    fn remove_unchecked(&mut self) {
        if let Err(err) = self.remove() {
            // the target stays patched; record it and let destruction finish
            tracing::error!(address = self.target, error = %err, "detour not removed");
            self.applied = false;
            self.orig.clear();
            self.trampoline = None;
            self.islands.clear();
        }
    }
}

impl Drop for DetourPatch<'_> {
    fn drop(&mut self) {
        self.remove_unchecked();
    }
}

/// patch size for the plain jump redirection
#[cfg(target_arch = "x86_64")]
fn jump_patch_size(target: usize, detour: usize) -> usize {
    if is_near(target, detour) {
        JMP_REL32_SIZE
    } else {
        JMP_INDIRECT_SIZE
    }
}

#[cfg(target_arch = "x86")]
fn jump_patch_size(_target: usize, _detour: usize) -> usize {
    JMP_REL32_SIZE
}

/// whether a rel32 jump at `from` reaches `to`
///
/// the displacement must lie strictly between the unsigned 32-bit bounds;
/// negative displacements are treated as out of reach
#[cfg(target_arch = "x86_64")]
pub(crate) fn is_near(from: usize, to: usize) -> bool {
    let rel = to as i64 - from as i64 - JMP_REL32_SIZE as i64;
    rel > i64::from(u32::MIN) && rel < i64::from(u32::MAX)
}

#[cfg(target_arch = "x86")]
pub(crate) fn is_near(_from: usize, _to: usize) -> bool {
    true
}

/// `E9 rel32`
fn encode_jmp_rel32(from: usize, to: usize) -> Vec<u8> {
    let disp = to.wrapping_sub(from).wrapping_sub(JMP_REL32_SIZE) as u32;
    let mut buf = vec![0xE9];
    buf.extend_from_slice(&disp.to_le_bytes());
    buf
}

/// `E8 rel32`
#[cfg(target_arch = "x86")]
fn encode_call_rel32(from: usize, to: usize) -> Vec<u8> {
    let disp = to.wrapping_sub(from).wrapping_sub(JMP_REL32_SIZE) as u32;
    let mut buf = vec![0xE8];
    buf.extend_from_slice(&disp.to_le_bytes());
    buf
}

/// `FF 25 rel32` — jump through the pointer at `slot`
#[cfg(target_arch = "x86_64")]
fn encode_jmp_indirect(from: usize, slot: usize) -> Vec<u8> {
    let disp = slot.wrapping_sub(from).wrapping_sub(JMP_INDIRECT_SIZE) as u32;
    let mut buf = vec![0xFF, 0x25];
    buf.extend_from_slice(&disp.to_le_bytes());
    buf
}

/// `FF 15 rel32` — call through the pointer at `slot`
#[cfg(target_arch = "x86_64")]
fn encode_call_indirect(from: usize, slot: usize) -> Vec<u8> {
    let disp = slot.wrapping_sub(from).wrapping_sub(JMP_INDIRECT_SIZE) as u32;
    let mut buf = vec![0xFF, 0x15];
    buf.extend_from_slice(&disp.to_le_bytes());
    buf
}

/// `push imm32; ret` for destinations with a zero high half
#[cfg(target_arch = "x86_64")]
fn encode_push_ret32(to: usize) -> Vec<u8> {
    let mut buf = vec![0x68];
    buf.extend_from_slice(&(to as u32).to_le_bytes());
    buf.push(0xC3);
    buf
}

/// `push imm32; mov dword ptr [rsp+4], imm32; ret` for full 64-bit targets
#[cfg(target_arch = "x86_64")]
fn encode_push_ret64(to: usize) -> Vec<u8> {
    let mut buf = vec![0x68];
    buf.extend_from_slice(&(to as u32).to_le_bytes());
    buf.extend_from_slice(&[0xC7, 0x44, 0x24, 0x04]);
    buf.extend_from_slice(&((to >> 32) as u32).to_le_bytes());
    buf.push(0xC3);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::test_util::{call_u32, exec_page, mov_eax_ret, serialize};

    #[test]
    fn test_encode_jmp_rel32() {
        let buf = encode_jmp_rel32(0x1000, 0x1100);
        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], 0xE9);
        let disp = i32::from_le_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(disp, 0xFB);
    }

    #[test]
    fn test_encode_jmp_rel32_backward() {
        let buf = encode_jmp_rel32(0x2000, 0x1000);
        let disp = i32::from_le_bytes(buf[1..5].try_into().unwrap());
        assert_eq!(disp, -0x1005);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_encode_jmp_indirect() {
        let buf = encode_jmp_indirect(0x1000, 0x1010);
        assert_eq!(buf.len(), 6);
        assert_eq!(&buf[0..2], &[0xFF, 0x25]);
        let disp = i32::from_le_bytes(buf[2..6].try_into().unwrap());
        assert_eq!(disp, 0xA);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_encode_push_ret_sizes() {
        assert_eq!(encode_push_ret32(0x1122_3344).len(), 6);
        assert_eq!(encode_push_ret64(0x11_2233_4455).len(), 14);

        let buf = encode_push_ret64(0xAABB_CCDD_1122_3344);
        assert_eq!(buf[0], 0x68);
        assert_eq!(&buf[1..5], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&buf[9..13], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(buf[13], 0xC3);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_is_near_rejects_negative_displacement() {
        // displacement bounds are the unsigned 32-bit limits, so a target
        // below the source is out of reach even when close by
        assert!(is_near(0x1000, 0x2000));
        assert!(!is_near(0x2000, 0x1000));
        assert!(!is_near(0x1000, 0x2_0000_0000));
    }

    #[test]
    fn test_detour_roundtrip() {
        let _serial = serialize();
        let process = crate::process::Process::current();
        let (page, target) = exec_page(&process, &mov_eax_ret(0x1122_3344));
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0xAABB_CCDD)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();

        let before = process.read_bytes(target, 16).unwrap();

        let mut patch = DetourPatch::new(&process, target, detour);
        assert!(patch.trampoline_ptr().is_none());
        patch.apply().expect("apply should succeed");
        assert!(patch.is_applied());

        assert_eq!(call_u32(target), 0xAABB_CCDD);
        let trampoline = patch.trampoline_ptr().expect("trampoline must exist");
        assert_eq!(call_u32(trampoline), 0x1122_3344);

        patch.remove().expect("remove should succeed");
        assert!(!patch.is_applied());
        assert_eq!(call_u32(target), 0x1122_3344);
        assert_eq!(process.read_bytes(target, 16).unwrap(), before);
    }

    #[test]
    fn test_apply_and_remove_are_idempotent() {
        let _serial = serialize();
        let process = crate::process::Process::current();
        let (page, target) = exec_page(&process, &mov_eax_ret(0x11));
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0x22)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();

        let mut patch = DetourPatch::new(&process, target, detour);
        patch.apply().unwrap();
        patch.apply().unwrap();
        assert_eq!(call_u32(target), 0x22);

        patch.remove().unwrap();
        patch.remove().unwrap();
        assert_eq!(call_u32(target), 0x11);
    }

    #[test]
    fn test_detached_patch_is_inert() {
        let _serial = serialize();
        let process = crate::process::Process::current();
        let (page, target) = exec_page(&process, &mov_eax_ret(0x11));
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0x22)).unwrap();

        let mut patch = DetourPatch::new(&process, target, detour);
        patch.detach();
        patch.apply().unwrap();
        assert!(!patch.is_applied());
        assert_eq!(call_u32(target), 0x11);
    }

    #[test]
    fn test_redirection_decodes_as_jump() {
        let _serial = serialize();
        let process = crate::process::Process::current();
        let (page, target) = exec_page(&process, &mov_eax_ret(0x11));
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0x22)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();

        let mut patch = DetourPatch::new(&process, target, detour);
        patch.apply().unwrap();

        // detour lives above target in the same page, so the redirection is
        // the 5-byte relative form and lands exactly on the detour
        let bytes = process.read_bytes(target, 5).unwrap();
        assert_eq!(bytes[0], 0xE9);
        let disp = i32::from_le_bytes(bytes[1..5].try_into().unwrap()) as i64;
        assert_eq!(target as i64 + 5 + disp, detour as i64);

        patch.remove().unwrap();
    }

    #[test]
    fn test_prologue_with_relative_call() {
        let _serial = serialize();
        let process = crate::process::Process::current();

        // +0x00: call +0x3B (-> +0x40); ret
        // +0x40: mov eax, 0x11223344; ret
        let mut code = vec![0u8; 0x48];
        code[0] = 0xE8;
        code[1..5].copy_from_slice(&0x3Bu32.to_le_bytes());
        code[5] = 0xC3;
        code[0x40..0x46].copy_from_slice(&mov_eax_ret(0x1122_3344));

        let (page, target) = exec_page(&process, &code);
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0xAABB_CCDD)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();

        assert_eq!(call_u32(target), 0x1122_3344);

        let mut patch = DetourPatch::new(&process, target, detour);
        patch.apply().expect("apply should relocate the call");

        assert_eq!(call_u32(target), 0xAABB_CCDD);
        let trampoline = patch.trampoline_ptr().unwrap();
        // the relocated call must still reach the original callee
        assert_eq!(call_u32(trampoline), 0x1122_3344);

        patch.remove().unwrap();
        assert_eq!(call_u32(target), 0x1122_3344);
    }

    #[test]
    fn test_trampoline_survives_remove() {
        let _serial = serialize();
        let process = crate::process::Process::current();
        let (page, target) = exec_page(&process, &mov_eax_ret(0x11));
        let detour = page.base() + 0x800;
        process.write_bytes(detour, &mov_eax_ret(0x22)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();

        let mut patch = DetourPatch::new(&process, target, detour);
        patch.apply().unwrap();
        let trampoline = patch.trampoline_ptr().unwrap();

        patch.remove().unwrap();
        // the delayed-free rule keeps the trampoline callable between cycles
        assert_eq!(patch.trampoline_ptr(), Some(trampoline));
        assert_eq!(call_u32(trampoline), 0x11);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_far_detour_uses_indirect_jump() {
        let _serial = serialize();
        let process = crate::process::Process::current();
        let (_page, target) = exec_page(&process, &mov_eax_ret(0x1122_3344));

        // hunt for a page beyond rel32 reach of the target
        let mut far_page = None;
        let mut hint = target.wrapping_add(0x1_0000_0000);
        for _ in 0..64 {
            if let Some(page) = crate::alloc::Allocation::try_at(&process, hint, 0x1000) {
                if !is_near(target, page.base()) && !is_near(page.base(), target) {
                    far_page = Some(page);
                    break;
                }
            }
            hint = hint.wrapping_add(0x1000_0000);
        }

        // address space layout may not cooperate; nothing to test then
        let Some(far_page) = far_page else {
            return;
        };

        let detour = far_page.base();
        process.write_bytes(detour, &mov_eax_ret(0xAABB_CCDD)).unwrap();
        process.flush_instruction_cache(detour, 6).unwrap();

        let mut patch = DetourPatch::new(&process, target, detour);
        patch.apply().expect("apply should fall back to an island");

        // far plan: 6-byte FF 25 through a pointer page near the target
        let bytes = process.read_bytes(target, 6).unwrap();
        assert_eq!(&bytes[0..2], &[0xFF, 0x25]);

        assert_eq!(call_u32(target), 0xAABB_CCDD);
        assert_eq!(call_u32(patch.trampoline_ptr().unwrap()), 0x1122_3344);

        patch.remove().unwrap();
        assert_eq!(call_u32(target), 0x1122_3344);
    }

    #[test]
    fn test_can_hook_chain() {
        let process = crate::process::Process::current();
        let patch = DetourPatch::new(&process, 0x1000, 0x2000);
        assert!(patch.can_hook_chain());
    }
}
