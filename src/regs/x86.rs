//! Sub-register views of [`RegisterState`] and the lookup used to compute operand
//! addresses of decoded instructions

use iced_x86::Register;

use super::RegisterState;

/// Implement the narrow views of a general purpose register
///
/// # Example
///
/// ```text
/// let eax = state.eax();
/// let al = state.al();
/// ```
macro_rules! impl_reg {
    ($reg:ident, $reg8_lo:ident, $reg8_hi:ident, $reg16:ident, $reg32:ident) => {
        #[doc = concat!("Read the ", stringify!($reg8_hi), " register")]
        #[must_use]
        pub fn $reg8_hi(&self) -> u8 {
            (self.$reg >> 8) as u8
        }

        impl_reg!($reg, $reg8_lo, $reg16, $reg32);
    };
    ($reg:ident, $reg8_lo:ident, $reg16:ident, $reg32:ident) => {
        #[doc = concat!("Read the ", stringify!($reg8_lo), " register")]
        #[must_use]
        pub fn $reg8_lo(&self) -> u8 {
            self.$reg as u8
        }

        #[doc = concat!("Read the ", stringify!($reg16), " register")]
        #[must_use]
        pub fn $reg16(&self) -> u16 {
            self.$reg as u16
        }

        #[doc = concat!("Read the ", stringify!($reg32), " register")]
        #[must_use]
        pub fn $reg32(&self) -> u32 {
            self.$reg as u32
        }
    };
}

#[allow(clippy::cast_possible_truncation)]
impl RegisterState {
    //        reg,  8lo,  8hi, 16bit, 32bit
    impl_reg!(rax, al, ah, ax, eax);
    impl_reg!(rbx, bl, bh, bx, ebx);
    impl_reg!(rcx, cl, ch, cx, ecx);
    impl_reg!(rdx, dl, dh, dx, edx);
    impl_reg!(rsi, sil, si, esi);
    impl_reg!(rdi, dil, di, edi);
    impl_reg!(rsp, spl, sp, esp);
    impl_reg!(rbp, bpl, bp, ebp);
    impl_reg!(r8, r8b, r8w, r8d);
    impl_reg!(r9, r9b, r9w, r9d);
    impl_reg!(r10, r10b, r10w, r10d);
    impl_reg!(r11, r11b, r11w, r11d);
    impl_reg!(r12, r12b, r12w, r12d);
    impl_reg!(r13, r13b, r13w, r13d);
    impl_reg!(r14, r14b, r14w, r14d);
    impl_reg!(r15, r15b, r15w, r15d);

    /// Get the value of the given [`iced_x86::Register`]. Segment registers resolve to
    /// their base, which is zero for everything but `fs` and `gs` in 64-bit code.
    /// Registers not carried in the state return `None`.
    #[must_use]
    pub fn iced_reg(&self, reg: Register) -> Option<u64> {
        let val = match reg {
            Register::AL => self.al().into(),
            Register::AH => self.ah().into(),
            Register::AX => self.ax().into(),
            Register::EAX => self.eax().into(),
            Register::RAX => self.rax,

            Register::BL => self.bl().into(),
            Register::BH => self.bh().into(),
            Register::BX => self.bx().into(),
            Register::EBX => self.ebx().into(),
            Register::RBX => self.rbx,

            Register::CL => self.cl().into(),
            Register::CH => self.ch().into(),
            Register::CX => self.cx().into(),
            Register::ECX => self.ecx().into(),
            Register::RCX => self.rcx,

            Register::DL => self.dl().into(),
            Register::DH => self.dh().into(),
            Register::DX => self.dx().into(),
            Register::EDX => self.edx().into(),
            Register::RDX => self.rdx,

            Register::SIL => self.sil().into(),
            Register::SI => self.si().into(),
            Register::ESI => self.esi().into(),
            Register::RSI => self.rsi,

            Register::DIL => self.dil().into(),
            Register::DI => self.di().into(),
            Register::EDI => self.edi().into(),
            Register::RDI => self.rdi,

            Register::SPL => self.spl().into(),
            Register::SP => self.sp().into(),
            Register::ESP => self.esp().into(),
            Register::RSP => self.rsp,

            Register::BPL => self.bpl().into(),
            Register::BP => self.bp().into(),
            Register::EBP => self.ebp().into(),
            Register::RBP => self.rbp,

            Register::R8L => self.r8b().into(),
            Register::R8W => self.r8w().into(),
            Register::R8D => self.r8d().into(),
            Register::R8 => self.r8,

            Register::R9L => self.r9b().into(),
            Register::R9W => self.r9w().into(),
            Register::R9D => self.r9d().into(),
            Register::R9 => self.r9,

            Register::R10L => self.r10b().into(),
            Register::R10W => self.r10w().into(),
            Register::R10D => self.r10d().into(),
            Register::R10 => self.r10,

            Register::R11L => self.r11b().into(),
            Register::R11W => self.r11w().into(),
            Register::R11D => self.r11d().into(),
            Register::R11 => self.r11,

            Register::R12L => self.r12b().into(),
            Register::R12W => self.r12w().into(),
            Register::R12D => self.r12d().into(),
            Register::R12 => self.r12,

            Register::R13L => self.r13b().into(),
            Register::R13W => self.r13w().into(),
            Register::R13D => self.r13d().into(),
            Register::R13 => self.r13,

            Register::R14L => self.r14b().into(),
            Register::R14W => self.r14w().into(),
            Register::R14D => self.r14d().into(),
            Register::R14 => self.r14,

            Register::R15L => self.r15b().into(),
            Register::R15W => self.r15w().into(),
            Register::R15D => self.r15d().into(),
            Register::R15 => self.r15,

            Register::EIP => u64::from(self.rip as u32),
            Register::RIP => self.rip,

            Register::CR0 => self.cr0,
            Register::CR2 => self.cr2,
            Register::CR3 => self.cr3,
            Register::CR4 => self.cr4,
            Register::CR8 => self.cr8,

            Register::FS => self.fs_base,
            Register::GS => self.gs_base,
            Register::CS | Register::DS | Register::ES | Register::SS if self.cs.long() => 0,
            Register::CS => self.cs.base,
            Register::DS => self.ds.base,
            Register::ES => self.es.base,
            Register::SS => self.ss.base,

            _ => return None,
        };

        Some(val)
    }
}
