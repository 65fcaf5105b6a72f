//! Segment descriptor helpers

use kvm_bindings::kvm_segment;
use serde::{Deserialize, Serialize};

/// Indicates whether a segment holds code or data
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    /// Code segment
    Code,

    /// Data segment
    Data,
}

/// Privilege level
#[allow(dead_code)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Privilege {
    /// Ring 0 privilege for Operating System / Kernel access
    Level0,

    /// Ring 1 privilege for Operating System Services
    Level1,

    /// Ring 2 privilege for Operating System Services
    Level2,

    /// Ring 3 privilege for Applications
    Level3,
}

impl From<u8> for Privilege {
    fn from(val: u8) -> Self {
        match val & 3 {
            0 => Privilege::Level0,
            1 => Privilege::Level1,
            2 => Privilege::Level2,
            _ => Privilege::Level3,
        }
    }
}

/// Bit layout of [`Segment::flags`], matching the VMX segment access rights
mod bits {
    /// Segment type (Table 3-1. Code- and Data-Segment Types)
    pub const TYPE: u16 = 0xf;

    /// Descriptor type (0 = system, 1 = code or data)
    pub const S: u16 = 1 << 4;

    /// Shift of the descriptor privilege level
    pub const DPL_SHIFT: u16 = 5;

    /// Segment present
    pub const P: u16 = 1 << 7;

    /// Available for use by system software
    pub const AVL: u16 = 1 << 12;

    /// 64-bit code segment
    pub const L: u16 = 1 << 13;

    /// Default operation size (0 = 16-bit, 1 = 32-bit)
    pub const DB: u16 = 1 << 14;

    /// Granularity
    pub const G: u16 = 1 << 15;
}

/// Execute/Read, accessed
const CODE_TYPE: u16 = 0xb;

/// Read/Write, accessed
const DATA_TYPE: u16 = 0x3;

/// A segment register: selector, cached base and limit, and the access rights flags
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Selector loaded into the segment register
    pub selector: u16,

    /// Linear base address of the segment
    pub base: u64,

    /// Segment limit
    pub limit: u32,

    /// Access rights: type[3:0], S[4], DPL[6:5], P[7], AVL[12], L[13], D/B[14], G[15]
    pub flags: u16,
}

impl Segment {
    /// Create a present code or data [`Segment`] with access rights consistent for the
    /// virtualization layer. The privilege level is taken from the selector RPL.
    #[must_use]
    pub fn new(
        type_: DescriptorType,
        base: u64,
        limit: u32,
        is_long: bool,
        selector: u16,
    ) -> Self {
        let mut flags = match type_ {
            DescriptorType::Code => CODE_TYPE,
            DescriptorType::Data => DATA_TYPE,
        };

        flags |= bits::S | bits::P;
        flags |= (selector & 3) << bits::DPL_SHIFT;

        match type_ {
            DescriptorType::Code if is_long => flags |= bits::L,
            DescriptorType::Code => flags |= bits::DB,
            DescriptorType::Data => flags |= bits::DB,
        }

        if limit > 0xf_ffff {
            flags |= bits::G;
        }

        Self {
            selector,
            base,
            limit,
            flags,
        }
    }

    /// Decode the raw 8 byte GDT/LDT descriptor loaded by `selector`
    #[must_use]
    pub fn from_descriptor(selector: u16, raw: u64) -> Self {
        let access = (raw >> 40) & 0xff;
        let high_flags = (raw >> 52) & 0xf;
        let flags = (access | (high_flags << 12)) as u16;

        let base = ((raw >> 16) & 0xff_ffff) | (((raw >> 56) & 0xff) << 24);

        let mut limit = ((raw & 0xffff) | (((raw >> 48) & 0xf) << 16)) as u32;
        if flags & bits::G != 0 {
            limit = (limit << 12) | 0xfff;
        }

        Self {
            selector,
            base,
            limit,
            flags,
        }
    }

    /// Segment type field
    #[must_use]
    pub fn segment_type(&self) -> u8 {
        (self.flags & bits::TYPE) as u8
    }

    /// Returns `true` if this is a code segment
    #[must_use]
    pub fn is_code(&self) -> bool {
        self.flags & bits::S != 0 && self.flags & 0x8 != 0
    }

    /// Descriptor privilege level
    #[must_use]
    pub fn privilege(&self) -> Privilege {
        Privilege::from(((self.flags >> bits::DPL_SHIFT) & 3) as u8)
    }

    /// Returns `true` if the present bit is set
    #[must_use]
    pub fn present(&self) -> bool {
        self.flags & bits::P != 0
    }

    /// Returns `true` if the 64-bit code bit is set
    #[must_use]
    pub fn long(&self) -> bool {
        self.flags & bits::L != 0
    }

    /// Bitness of code executing in this segment
    #[must_use]
    pub fn bitness(&self) -> u32 {
        if self.long() {
            64
        } else if self.flags & bits::DB != 0 {
            32
        } else {
            16
        }
    }
}

impl From<&kvm_segment> for Segment {
    fn from(seg: &kvm_segment) -> Self {
        let mut flags = u16::from(seg.type_) & bits::TYPE;
        flags |= u16::from(seg.s & 1) << 4;
        flags |= u16::from(seg.dpl & 3) << bits::DPL_SHIFT;
        flags |= u16::from(seg.present & 1) << 7;
        flags |= u16::from(seg.avl & 1) << 12;
        flags |= u16::from(seg.l & 1) << 13;
        flags |= u16::from(seg.db & 1) << 14;
        flags |= u16::from(seg.g & 1) << 15;

        Self {
            selector: seg.selector,
            base: seg.base,
            limit: seg.limit,
            flags,
        }
    }
}

impl From<&Segment> for kvm_segment {
    fn from(seg: &Segment) -> Self {
        let bit = |mask: u16| u8::from(seg.flags & mask != 0);

        kvm_segment {
            base: seg.base,
            limit: seg.limit,
            selector: seg.selector,
            type_: seg.segment_type(),
            present: bit(bits::P),
            dpl: ((seg.flags >> bits::DPL_SHIFT) & 3) as u8,
            db: bit(bits::DB),
            s: bit(bits::S),
            l: bit(bits::L),
            g: bit(bits::G),
            avl: bit(bits::AVL),
            unusable: u8::from(!seg.present()),
            padding: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_mode_code_segment() {
        let cs = Segment::new(DescriptorType::Code, 0, 0xffff_ffff, true, 0x10);
        assert_eq!(cs.flags, 0xa09b);
        assert!(cs.is_code());
        assert!(cs.long());
        assert_eq!(cs.bitness(), 64);
        assert_eq!(cs.privilege(), Privilege::Level0);

        let ss = Segment::new(DescriptorType::Data, 0, 0, false, 0x2b);
        assert_eq!(ss.flags, 0x40f3);
        assert!(!ss.is_code());
        assert_eq!(ss.privilege(), Privilege::Level3);
    }

    #[test]
    fn gdt_descriptors() {
        // Flat 64-bit kernel code and 32-bit user data descriptors
        let cs = Segment::from_descriptor(0x10, 0x00af_9b00_0000_ffff);
        assert_eq!(cs.flags, 0xa09b);
        assert_eq!(cs.limit, 0xffff_ffff);
        assert_eq!(cs.base, 0);
        assert!(cs.long());

        let ds = Segment::from_descriptor(0x2b, 0x00cf_f300_0000_ffff);
        assert_eq!(ds.flags, 0xc0f3);
        assert_eq!(ds.privilege(), Privilege::Level3);

        // Base spread over the descriptor
        let seg = Segment::from_descriptor(0x30, 0x1240_9312_3456_0fff);
        assert_eq!(seg.base, 0x1212_3456);
        assert_eq!(seg.limit, 0xfff);
    }

    #[test]
    fn kvm_segment_conversion() {
        let seg = kvm_segment {
            base: 0xf0000,
            limit: 0xffff,
            selector: 0xf000,
            type_: 0xb,
            present: 1,
            dpl: 0,
            db: 0,
            s: 1,
            l: 0,
            g: 0,
            avl: 0,
            unusable: 0,
            padding: 0,
        };

        let converted = Segment::from(&seg);
        assert_eq!(converted.flags, 0x9b);
        assert_eq!(converted.bitness(), 16);

        let back = kvm_segment::from(&converted);
        assert_eq!(back.base, seg.base);
        assert_eq!(back.selector, seg.selector);
        assert_eq!(back.type_, seg.type_);
        assert_eq!((back.s, back.present, back.unusable), (1, 1, 0));

        // Null data selectors are not present and thus unusable
        let null = kvm_segment::from(&Segment::default());
        assert_eq!(null.unusable, 1);
    }
}
