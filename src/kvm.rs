//! KVM ioctls and capabilities not wrapped by `kvm-ioctls`

use anyhow::{anyhow, ensure, Result};

use kvm_bindings::{
    kvm_clear_dirty_log, kvm_clear_dirty_log__bindgen_ty_1, kvm_dirty_log,
    kvm_dirty_log__bindgen_ty_1, KVMIO, KVM_SYNC_X86_REGS, KVM_SYNC_X86_SREGS,
};
use kvm_ioctls::{Cap, Kvm, VmFd};

use vmm_sys_util::ioctl::{
    ioctl_with_ref, ioctl_with_val, _IOC_DIRSHIFT, _IOC_NONE, _IOC_NRSHIFT, _IOC_READ,
    _IOC_SIZESHIFT, _IOC_TYPESHIFT, _IOC_WRITE,
};

use std::os::raw::c_ulong;

/// Calculate a `KVMIO` ioctl number
#[allow(clippy::cast_possible_truncation, clippy::cast_lossless)]
const fn kvm_ioctl_nr(dir: u32, nr: u32, size: usize) -> c_ulong {
    ((dir << _IOC_DIRSHIFT)
        | (KVMIO << _IOC_TYPESHIFT)
        | (nr << _IOC_NRSHIFT)
        | ((size as u32) << _IOC_SIZESHIFT)) as c_ulong
}

/// `_IOW(KVMIO, 0x42, struct kvm_dirty_log)`
const KVM_GET_DIRTY_LOG: c_ulong =
    kvm_ioctl_nr(_IOC_WRITE, 0x42, std::mem::size_of::<kvm_dirty_log>());

/// `_IOWR(KVMIO, 0xc0, struct kvm_clear_dirty_log)`
const KVM_CLEAR_DIRTY_LOG: c_ulong = kvm_ioctl_nr(
    _IOC_READ | _IOC_WRITE,
    0xc0,
    std::mem::size_of::<kvm_clear_dirty_log>(),
);

/// `_IO(KVMIO, 0x03)`
const KVM_CHECK_EXTENSION: c_ulong = kvm_ioctl_nr(_IOC_NONE, 0x03, 0);

/// Number of `u64` words needed for a dirty bitmap covering `pages` pages
#[must_use]
pub(crate) fn bitmap_words(pages: u64) -> usize {
    usize::try_from((pages + 63) / 64).unwrap_or(usize::MAX)
}

/// Fetch the dirty bitmap of `slot` into `bitmap`, one bit per page of the slot
///
/// # Errors
///
/// * `KVM_GET_DIRTY_LOG` failed
pub(crate) fn get_dirty_log(vm: &VmFd, slot: u32, bitmap: &mut [u64]) -> Result<()> {
    let dirty_bitmap = bitmap.as_mut_ptr().cast::<libc::c_void>();

    let dirty_log = kvm_dirty_log {
        slot,
        padding1: 0,
        __bindgen_anon_1: kvm_dirty_log__bindgen_ty_1 { dirty_bitmap },
    };

    // Safe because we know that our file is a VM fd, and the caller sized the bitmap with
    // at least one bit per page of the slot.
    let ret = unsafe { ioctl_with_ref(vm, KVM_GET_DIRTY_LOG, &dirty_log) };

    if ret != 0 {
        return Err(anyhow!(nix::errno::Errno::last()));
    }

    Ok(())
}

/// Write protect again the pages set in `bitmap` for `slot`, which is `pages` pages large
///
/// # Errors
///
/// * `KVM_CLEAR_DIRTY_LOG` failed
pub(crate) fn clear_dirty_log(vm: &VmFd, slot: u32, pages: u64, bitmap: &mut [u64]) -> Result<()> {
    ensure!(bitmap.len() >= bitmap_words(pages), "dirty bitmap too small");

    let dirty_bitmap = bitmap.as_mut_ptr().cast::<libc::c_void>();

    let clear_log = kvm_clear_dirty_log {
        slot,
        num_pages: u32::try_from(pages)?,
        first_page: 0,
        __bindgen_anon_1: kvm_clear_dirty_log__bindgen_ty_1 { dirty_bitmap },
    };

    // Safe because we know that our file is a VM fd, and the bitmap covers `num_pages`
    let ret = unsafe { ioctl_with_ref(vm, KVM_CLEAR_DIRTY_LOG, &clear_log) };

    if ret != 0 {
        return Err(anyhow!(nix::errno::Errno::last()));
    }

    Ok(())
}

/// Wrapper over `KVM_CHECK_EXTENSION`.
///
/// Returns 0 if the capability is not available and a positive integer otherwise.
pub(crate) fn check_extension_int(kvm: &Kvm, c: Cap) -> i32 {
    // Safe because we know that our file is a KVM fd and that the extension is one of the ones
    // defined by kernel.
    unsafe { ioctl_with_val(kvm, KVM_CHECK_EXTENSION, c as libc::c_ulong) }
}

/// Check that the host KVM supports everything the backend relies on
///
/// # Errors
///
/// * A required capability is missing
pub(crate) fn sanity_check_kvm(kvm: &Kvm) -> Result<()> {
    #[allow(clippy::cast_sign_loss)]
    let sync_regs = check_extension_int(kvm, Cap::SyncRegs) as u32;
    let wanted = KVM_SYNC_X86_REGS | KVM_SYNC_X86_SREGS;
    ensure!(sync_regs & wanted == wanted, "KVM sync regs not supported");

    for cap in [
        Cap::SetGuestDebug,
        Cap::X86RobustSinglestep,
        Cap::SetTssAddr,
        Cap::ImmediateExit,
        Cap::EnableCapVm,
        Cap::ExtCpuid,
    ] {
        ensure!(kvm.check_extension(cap), "KVM capability {cap:?} not supported");
    }

    Ok(())
}

/// Enable manual dirty log protect in the given VM.
///
/// According to the KVM Documentation, "At the cost of a slightly more complicated
/// operation, this provides better scalability and responsiveness"
pub(crate) fn enable_manual_dirty_log_protect(vm: &VmFd) -> Result<()> {
    /// Argument to enable the `DirtyLogProtect2` capability
    const KVM_DIRTY_LOG_MANUAL_PROTECT_ENABLE: u64 = 1;

    /// Capability number for `DirtyLogProtect2`
    const KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2: u32 = 168;

    let cap = kvm_bindings::kvm_enable_cap {
        cap: KVM_CAP_MANUAL_DIRTY_LOG_PROTECT2,
        args: [KVM_DIRTY_LOG_MANUAL_PROTECT_ENABLE, 0, 0, 0],
        ..kvm_bindings::kvm_enable_cap::default()
    };

    vm.enable_cap(&cap)?;

    Ok(())
}
