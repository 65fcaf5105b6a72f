//! Emulator tests against the real KVM backend. Each test returns early on hosts
//! without `/dev/kvm`.

use snaptrace::exit::OtherExit;
use snaptrace::{Emulator, ExitReason, KvmProcessor};

const RAM_BASE: u64 = 0;
const RAM_SIZE: u64 = 0x1000 * 240;
const ROM_BASE: u64 = 0xf_0000;
const ROM_SIZE: u64 = 0x1000 * 16;

fn emulator() -> Option<Emulator> {
    if !KvmProcessor::is_available() {
        eprintln!("KVM is not available, skipping");
        return None;
    }

    Some(Emulator::with_memory_size(0x10_0000).unwrap())
}

#[test]
fn fresh_registers() {
    let Some(mut emu) = emulator() else { return };
    assert_eq!(emu.get_reg("rax").unwrap(), 0);
    assert!(emu.get_reg("not_a_register").is_err());
}

#[test]
fn unallocated_memory() {
    let Some(mut emu) = emulator() else { return };
    assert!(emu.read_physical_memory(0x1000, 4).is_err());
    assert!(emu.write_physical_memory(0x1000, b"\x01\x02\x03\x04").is_err());
}

#[test]
fn physical_memory() {
    let Some(mut emu) = emulator() else { return };

    assert_eq!(emu.allocate_physical_memory(0x1000, 0x1000).unwrap(), 0x1000);
    emu.write_physical_memory(0x1000, b"\x01\x02\x03\x04").unwrap();
    emu.write_physical_memory(0x1400, b"\xaa\xbb\xcc\xdd").unwrap();

    assert_eq!(emu.read_physical_memory(0x1000, 4).unwrap(), b"\x01\x02\x03\x04");
    assert_eq!(emu.read_physical_memory(0x1400, 4).unwrap(), b"\xaa\xbb\xcc\xdd");

    assert_eq!(emu.allocate_physical_memory(0x2000, 0x1000).unwrap(), 0x2000);
    emu.write_physical_memory(0x2000, b"\x05\x06").unwrap();
    assert_eq!(emu.read_physical_memory(0x2000, 2).unwrap(), b"\x05\x06");
    assert_eq!(emu.read_physical_memory(0x1000, 4).unwrap(), b"\x01\x02\x03\x04");

    // Overlapping allocations are refused
    assert!(emu.allocate_physical_memory(0x1800, 0x1000).is_err());
}

/// Run until the next exit that isn't a kick of the timer and check that it is a halt
/// at `rip`
fn halt_at(emu: &mut Emulator, rip: u64) {
    let exit = loop {
        let exit = emu.run().unwrap();
        if exit.reason != ExitReason::Other(OtherExit::Interrupted) {
            break exit;
        }
    };

    assert!(exit.is_halt(), "unexpected exit {exit}");
    assert_eq!(exit.rip, rip);
}

/// 32-bit trap gate, selector 0x8, present, DPL 0
const fn trap_gate(offset: u32) -> [u8; 8] {
    let [o0, o1, o2, o3] = offset.to_le_bytes();
    [o0, o1, 0x08, 0x00, 0x00, 0x8f, o2, o3]
}

/// Reset vector at ROM+0xfff0: load the GDT and IDT stored in the ROM, enter protected
/// mode then jump to the setup code at ROM+0xff00
#[rustfmt::skip]
const RESET: [u8; 16] = [
    0xeb, 0xde,                         // jmp short 0xffd0
    0x18, 0x00, 0x00, 0x00, 0x0f, 0x00, // GDT pointer: 0xf0000:0x18
    0x10, 0x01, 0x18, 0x00, 0x0f, 0x00, // IDT pointer: 0xf0018:0x110
    0xf4, 0xf4,                         // hlt; hlt
];

#[rustfmt::skip]
const ENTER_PROTECTED_MODE: [u8; 30] = [
    0x66, 0x2e, 0x0f, 0x01, 0x16, 0xf2, 0xff,       // lgdt [cs:0xfff2]
    0x66, 0x2e, 0x0f, 0x01, 0x1e, 0xf8, 0xff,       // lidt [cs:0xfff8]
    0x0f, 0x20, 0xc0,                               // mov eax, cr0
    0x0c, 0x01,                                     // or al, 1
    0x0f, 0x22, 0xc0,                               // mov cr0, eax
    0x66, 0xea, 0x00, 0xff, 0x0f, 0x00, 0x08, 0x00, // jmp dword 0x8:0xfff00
];

/// Build 32-bit page tables, enable paging, read 0xdeadbeef through a virtual address
/// and halt, then jump to RAM
#[rustfmt::skip]
const SETUP: [u8; 200] = [
    0x33, 0xc0,                   // xor eax, eax
    0xb0, 0x10,                   // mov al, 0x10
    0x8e, 0xd8,                   // mov ds, eax
    0x8e, 0xc0,                   // mov es, eax
    0x8e, 0xd0,                   // mov ss, eax

    // Clear the page directory
    0xbf, 0x00, 0x10, 0x00, 0x00, // mov edi, 0x1000
    0xb9, 0x00, 0x10, 0x00, 0x00, // mov ecx, 0x1000
    0x31, 0xc0,                   // xor eax, eax
    0xf3, 0xab,                   // rep stosd

    0xbf, 0x00, 0x50, 0x00, 0x00, // mov edi, 0x5000
    0xb8, 0xef, 0xbe, 0xad, 0xde, // mov eax, 0xdeadbeef
    0x89, 0x07,                   // mov [edi], eax

    // Identity map the RAM
    0xb9, 0x00, 0x01, 0x00, 0x00, // mov ecx, 0x100
    0xbf, 0x00, 0x20, 0x00, 0x00, // mov edi, 0x2000
    0xb8, 0x03, 0x00, 0x00, 0x00, // mov eax, 0x3
    0xab,                         // stosd
    0x05, 0x00, 0x10, 0x00, 0x00, // add eax, 0x1000
    0xe2, 0xf8,                   // loop -8

    // Identity map the ROM
    0xb9, 0x10, 0x00, 0x00, 0x00, // mov ecx, 0x10
    0xbf, 0xc0, 0x3f, 0x00, 0x00, // mov edi, 0x3fc0
    0xb8, 0x03, 0x00, 0x0f, 0x00, // mov eax, 0xf0003
    0xab,                         // stosd
    0x05, 0x00, 0x10, 0x00, 0x00, // add eax, 0x1000
    0xe2, 0xf8,                   // loop -8

    // 0x10000000 -> 0x5000, 0x10001000 -> 0x6000, 0xe0000000 -> 0xe0000000
    0xbf, 0x00, 0x40, 0x00, 0x00, // mov edi, 0x4000
    0xb8, 0x03, 0x50, 0x00, 0x00, // mov eax, 0x5003
    0x89, 0x07,                   // mov [edi], eax
    0xbf, 0x04, 0x40, 0x00, 0x00, // mov edi, 0x4004
    0xb8, 0x03, 0x60, 0x00, 0x00, // mov eax, 0x6003
    0x89, 0x07,                   // mov [edi], eax
    0xbf, 0x00, 0xe0, 0x00, 0x00, // mov edi, 0xe000
    0xb8, 0x03, 0x00, 0x00, 0xe0, // mov eax, 0xe0000003
    0x89, 0x07,                   // mov [edi], eax

    // Page directory entries
    0xbf, 0x00, 0x10, 0x00, 0x00, // mov edi, 0x1000
    0xb8, 0x03, 0x20, 0x00, 0x00, // mov eax, 0x2003
    0x89, 0x07,                   // mov [edi], eax
    0xbf, 0xfc, 0x1f, 0x00, 0x00, // mov edi, 0x1ffc
    0xb8, 0x03, 0x30, 0x00, 0x00, // mov eax, 0x3003
    0x89, 0x07,                   // mov [edi], eax
    0xbf, 0x00, 0x11, 0x00, 0x00, // mov edi, 0x1100
    0xb8, 0x03, 0x40, 0x00, 0x00, // mov eax, 0x4003
    0x89, 0x07,                   // mov [edi], eax
    0xbf, 0x00, 0x1e, 0x00, 0x00, // mov edi, 0x1e00
    0xb8, 0x03, 0xe0, 0x00, 0x00, // mov eax, 0xe003
    0x89, 0x07,                   // mov [edi], eax

    0xb8, 0x00, 0x10, 0x00, 0x00, // mov eax, 0x1000
    0x0f, 0x22, 0xd8,             // mov cr3, eax
    0x0f, 0x20, 0xc0,             // mov eax, cr0
    0x0d, 0x00, 0x00, 0x00, 0x80, // or eax, 0x80000000
    0x0f, 0x22, 0xc0,             // mov cr0, eax

    0x31, 0xc0,                   // xor eax, eax
    0xbe, 0x00, 0x00, 0x00, 0x10, // mov esi, 0x10000000
    0x8b, 0x06,                   // mov eax, [esi]
    0xf4,                         // hlt
    0xe9, 0x3c, 0x00, 0xf0, 0x0f, // jmp 0x10000004
];

/// Code at 0x5004, mapped at 0x10000004
#[rustfmt::skip]
const RAM_CODE: [u8; 34] = [
    0xba, 0x78, 0x56, 0x34, 0x12, // mov edx, 0x12345678
    0xbf, 0x00, 0x00, 0x00, 0x10, // mov edi, 0x10000000
    0x31, 0xd0,                   // xor eax, edx
    0x89, 0x07,                   // mov [edi], eax
    0xf4,                         // hlt

    0x31, 0xed,                   // xor ebp, ebp
    0xbc, 0x00, 0x00, 0x0f, 0x00, // mov esp, 0xf0000
    0x68, 0xfe, 0xca, 0x0d, 0xf0, // push 0xf00dcafe
    0x5a,                         // pop edx
    0xf4,                         // hlt

    0xcd, 0x20,                   // int 0x20
    0xcd, 0x21,                   // int 0x21
    0xf4,                         // hlt
];

/// Interrupt handlers at 0x6000, mapped at 0x10001000
#[rustfmt::skip]
const HANDLERS: [u8; 10] = [
    0xfb, 0xcf,                   // 0x20: sti; iretd
    0xf4, 0xfb, 0xcf,             // 0x21: hlt; sti; iretd
    0x83, 0xc4, 0x04, 0xfb, 0xcf, // exceptions: add esp, 4; sti; iretd
];

#[test]
fn boot_sector() {
    let Some(mut emu) = emulator() else { return };

    emu.allocate_physical_memory(ROM_BASE, ROM_SIZE).unwrap();
    emu.allocate_physical_memory(RAM_BASE, RAM_SIZE).unwrap();

    // GDT: null, flat 4GiB code, flat 4GiB data
    emu.write_physical_memory(ROM_BASE, &[0; 8]).unwrap();
    emu.write_physical_memory(ROM_BASE + 0x08, b"\xff\xff\x00\x00\x00\x9b\xcf\x00")
        .unwrap();
    emu.write_physical_memory(ROM_BASE + 0x10, b"\xff\xff\x00\x00\x00\x93\xcf\x00")
        .unwrap();

    // IDT: exceptions, then the two software interrupts
    for vector in 0..0x20 {
        emu.write_physical_memory(ROM_BASE + 0x18 + vector * 8, &trap_gate(0x1000_1005))
            .unwrap();
    }
    emu.write_physical_memory(ROM_BASE + 0x118, &trap_gate(0x1000_1000))
        .unwrap();
    emu.write_physical_memory(ROM_BASE + 0x120, &trap_gate(0x1000_1002))
        .unwrap();

    emu.write_physical_memory(ROM_BASE + 0xff00, &SETUP).unwrap();
    emu.write_physical_memory(ROM_BASE + 0xffd0, &ENTER_PROTECTED_MODE)
        .unwrap();
    emu.write_physical_memory(ROM_BASE + 0xffef, &[0xf4]).unwrap();
    emu.write_physical_memory(ROM_BASE + 0xfff0, &RESET).unwrap();

    emu.write_physical_memory(RAM_BASE + 0x5004, &RAM_CODE).unwrap();
    emu.write_physical_memory(RAM_BASE + 0x6000, &HANDLERS).unwrap();

    // Start at the reset vector of the ROM, keeping the real mode attributes of cs
    let mut state = emu.state().unwrap();
    state.cs.base = ROM_BASE;
    state.cs.selector = 0xf000;
    state.cs.limit = 0xffff;
    state.rip = 0xfff0;
    emu.set_state(&state).unwrap();

    // Paging enabled, 0xdeadbeef read through 0x10000000
    halt_at(&mut emu, 0xf_ffc3);
    assert_eq!(emu.get_reg("rax").unwrap(), 0xdead_beef);
    assert_eq!(emu.get_reg("cr3").unwrap(), 0x1000);

    halt_at(&mut emu, 0x1000_0013);
    assert_eq!(emu.get_reg("rdx").unwrap(), 0x1234_5678);
    assert_eq!(
        emu.read_physical_memory(0x5000, 4).unwrap(),
        (0xdead_beef_u32 ^ 0x1234_5678).to_le_bytes()
    );

    halt_at(&mut emu, 0x1000_0021);
    assert_eq!(emu.get_reg("rdx").unwrap(), 0xf00d_cafe);
    assert_eq!(emu.get_reg("rsp").unwrap(), 0xf_0000);

    // Inside the handler of int 0x21, after the one of int 0x20 returned
    halt_at(&mut emu, 0x1000_1003);
    halt_at(&mut emu, 0x1000_0026);
}
