//! Single-instruction decoding using iced-x86
//!
//! The prologue relocator consumes one instruction at a time and only needs
//! to know three things about each: how long it is, whether it is a direct
//! branch with an immediate operand, and whether it is the RIP-indirect jump
//! form that earlier detours leave behind. Everything else is copied
//! verbatim.

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind};

/// how an instruction must be treated when moved into the trampoline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// `jmp` with a sign-extended immediate; destination is absolute
    DirectJump { dest: u64 },
    /// `call` with a sign-extended immediate; destination is absolute
    DirectCall { dest: u64 },
    /// `jmp qword ptr [rip+disp32]`; `slot` holds the pointer to follow
    RipIndirectJump { slot: u64 },
    /// position-independent within the prologue; copy the bytes
    Plain,
}

/// one decoded instruction
#[derive(Debug, Clone)]
pub struct Decoded {
    inner: Instruction,
    transfer: Transfer,
}

impl Decoded {
    /// instruction length in bytes
    pub fn length(&self) -> usize {
        self.inner.len()
    }

    /// how the relocator must treat this instruction
    pub fn transfer(&self) -> Transfer {
        self.transfer
    }

    /// the instruction mnemonic
    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }
}

/// instruction decoder fixed to one bitness
pub struct InstructionDecoder {
    bitness: u32,
}

impl InstructionDecoder {
    /// create decoder for the build architecture
    #[cfg(target_arch = "x86_64")]
    pub fn native() -> Self {
        Self { bitness: 64 }
    }

    /// create decoder for the build architecture
    #[cfg(target_arch = "x86")]
    pub fn native() -> Self {
        Self { bitness: 32 }
    }

    /// create 64-bit decoder
    pub fn x64() -> Self {
        Self { bitness: 64 }
    }

    /// create 32-bit decoder
    pub fn x86() -> Self {
        Self { bitness: 32 }
    }

    /// decode the instruction at the start of `bytes`, mapped at `address`
    pub fn decode_at(&self, address: usize, bytes: &[u8]) -> Option<Decoded> {
        if bytes.is_empty() {
            return None;
        }

        let mut decoder = Decoder::with_ip(self.bitness, bytes, address as u64, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return None;
        }

        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return None;
        }

        let transfer = self.classify(&instruction);
        Some(Decoded {
            inner: instruction,
            transfer,
        })
    }

    fn classify(&self, instruction: &Instruction) -> Transfer {
        let mnemonic = instruction.mnemonic();
        if mnemonic != Mnemonic::Jmp && mnemonic != Mnemonic::Call {
            return Transfer::Plain;
        }

        // JMP QWORD PTR [RIP+disp32], the form a prior detour writes;
        // following it keeps hook chains intact
        if self.bitness == 64
            && instruction.code() == Code::Jmp_rm64
            && instruction.is_ip_rel_memory_operand()
        {
            return Transfer::RipIndirectJump {
                slot: instruction.ip_rel_memory_address(),
            };
        }

        match instruction.op0_kind() {
            // immediate operand of any width; iced folds base + len + disp
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64 => {
                let dest = instruction.near_branch_target();
                if mnemonic == Mnemonic::Jmp {
                    Transfer::DirectJump { dest }
                } else {
                    Transfer::DirectCall { dest }
                }
            }
            _ => Transfer::Plain,
        }
    }
}
