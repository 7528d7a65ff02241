//! Privilege primitives and the privilege-drop pipeline.
//!
//! Changing identity is harder than it looks. On Linux the raw `set*id`
//! system calls are per-thread: issuing `syscall(SYS_setuid, ..)` from one
//! thread leaves every other thread running with the old identity. The libc
//! wrappers (glibc and musl alike) broadcast the change to all threads of
//! the process, which is why everything in this module goes through
//! `libc::set*` and never through `libc::syscall`. The payload may already
//! be multi-threaded when the drop runs; after any of these functions
//! returns success, no thread retains the old identity.

use crate::daemonize::ChrootAnchor;
use crate::error::{ServiceError, ServiceResult};
use crate::ident;

// =========================================================================
// Identity primitives (process-wide)
// =========================================================================

/// Sets the real, effective and saved UID to `uid` if the process has the
/// privilege to do so, otherwise only the effective UID.
pub fn setuid(uid: libc::uid_t) -> ServiceResult<()> {
    if unsafe { libc::setuid(uid) } < 0 {
        return Err(ServiceError::last_syscall("setuid"));
    }
    Ok(())
}

/// Sets the real, effective and saved GID to `gid` if the process has the
/// privilege to do so, otherwise only the effective GID.
pub fn setgid(gid: libc::gid_t) -> ServiceResult<()> {
    if unsafe { libc::setgid(gid) } < 0 {
        return Err(ServiceError::last_syscall("setgid"));
    }
    Ok(())
}

/// Replaces the supplementary group list of the process.
pub fn setgroups(gids: &[libc::gid_t]) -> ServiceResult<()> {
    if unsafe { libc::setgroups(gids.len() as _, gids.as_ptr()) } < 0 {
        return Err(ServiceError::last_syscall("setgroups"));
    }
    Ok(())
}

/// Sets the real, effective and saved UID in a single call.
#[cfg(not(target_os = "macos"))]
pub fn setresuid(ruid: libc::uid_t, euid: libc::uid_t, suid: libc::uid_t) -> ServiceResult<()> {
    if unsafe { libc::setresuid(ruid, euid, suid) } < 0 {
        return Err(ServiceError::last_syscall("setresuid"));
    }
    Ok(())
}

/// Sets the real, effective and saved GID in a single call.
#[cfg(not(target_os = "macos"))]
pub fn setresgid(rgid: libc::gid_t, egid: libc::gid_t, sgid: libc::gid_t) -> ServiceResult<()> {
    if unsafe { libc::setresgid(rgid, egid, sgid) } < 0 {
        return Err(ServiceError::last_syscall("setresgid"));
    }
    Ok(())
}

// Darwin has no saved IDs, so setre[ug]id is the closest available call.
#[cfg(target_os = "macos")]
pub fn setresuid(ruid: libc::uid_t, euid: libc::uid_t, _suid: libc::uid_t) -> ServiceResult<()> {
    if unsafe { libc::setreuid(ruid, euid) } < 0 {
        return Err(ServiceError::last_syscall("setreuid"));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub fn setresgid(rgid: libc::gid_t, egid: libc::gid_t, _sgid: libc::gid_t) -> ServiceResult<()> {
    if unsafe { libc::setregid(rgid, egid) } < 0 {
        return Err(ServiceError::last_syscall("setregid"));
    }
    Ok(())
}

// =========================================================================
// Capabilities
// =========================================================================

/// True iff the target platform has a capability concept this build can
/// inspect and drop.
#[cfg(all(target_os = "linux", feature = "caps"))]
pub const PLATFORM_SUPPORTS_CAPS: bool = true;

#[cfg(not(all(target_os = "linux", feature = "caps")))]
pub const PLATFORM_SUPPORTS_CAPS: bool = false;

/// Returns true iff any capability is present in the effective, permitted
/// or inheritable set. Inspection failures count as "still privileged".
#[cfg(all(target_os = "linux", feature = "caps"))]
pub fn has_any_capability() -> bool {
    use caps::CapSet;

    for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
        match caps::read(None, set) {
            Ok(held) if held.is_empty() => {}
            _ => return true,
        }
    }
    false
}

/// Installs an empty capability set as the process's effective, permitted
/// and inheritable sets.
#[cfg(all(target_os = "linux", feature = "caps"))]
pub fn drop_all_capabilities() -> ServiceResult<()> {
    use caps::CapSet;

    for set in [CapSet::Inheritable, CapSet::Effective, CapSet::Permitted] {
        caps::clear(None, set).map_err(|e| {
            ServiceError::PrivilegeDrop(format!("cannot clear capability set: {}", e))
        })?;
    }
    Ok(())
}

#[cfg(not(all(target_os = "linux", feature = "caps")))]
pub fn has_any_capability() -> bool {
    false
}

#[cfg(not(all(target_os = "linux", feature = "caps")))]
pub fn drop_all_capabilities() -> ServiceResult<()> {
    Ok(())
}

// =========================================================================
// Hardening (prctl)
// =========================================================================

#[cfg(target_os = "linux")]
pub const SECBIT_NOROOT: libc::c_ulong = 1 << 0;
#[cfg(target_os = "linux")]
pub const SECBIT_NOROOT_LOCKED: libc::c_ulong = 1 << 1;
#[cfg(target_os = "linux")]
pub const SECBIT_KEEP_CAPS_LOCKED: libc::c_ulong = 1 << 5;

/// Sets the Linux securebits mask. Requires CAP_SETPCAP, so this only
/// works when started as root.
#[cfg(target_os = "linux")]
pub fn set_securebits(mask: libc::c_ulong) -> ServiceResult<()> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECUREBITS,
            mask,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret < 0 {
        return Err(ServiceError::last_syscall("prctl(PR_SET_SECUREBITS)"));
    }
    Ok(())
}

/// Sets the NO_NEW_PRIVS flag: this process and its descendants can never
/// regain privileges by executing a suid/sgid/cap-xattr binary.
#[cfg(target_os = "linux")]
pub fn set_no_new_privs() -> ServiceResult<()> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret < 0 {
        return Err(ServiceError::last_syscall("prctl(PR_SET_NO_NEW_PRIVS)"));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_no_new_privs() -> ServiceResult<()> {
    Err(ServiceError::PrivilegeDrop(
        "NO_NEW_PRIVS is not supported on this platform".to_owned(),
    ))
}

/// Best-effort suid lockout for the paths that do not run the full drop
/// pipeline. Securebits first (needs capabilities we may be about to lose),
/// then NO_NEW_PRIVS.
pub(crate) fn harden_best_effort() {
    #[cfg(target_os = "linux")]
    if let Err(err) = set_securebits(SECBIT_NOROOT | SECBIT_NOROOT_LOCKED | SECBIT_KEEP_CAPS_LOCKED)
    {
        log::debug!("cannot set securebits (continuing): {}", err);
    }
    if let Err(err) = set_no_new_privs() {
        log::debug!("cannot set NO_NEW_PRIVS (continuing): {}", err);
    }
}

// =========================================================================
// Root detection and the drop pipeline
// =========================================================================

fn ids_root() -> bool {
    unsafe {
        libc::getuid() == 0
            || libc::geteuid() == 0
            || libc::getgid() == 0
            || libc::getegid() == 0
    }
}

/// Returns true if any of the UID, EUID, GID or EGID are zero, or, on
/// platforms with capability support, if any capabilities are held.
pub fn is_root() -> bool {
    has_any_capability() || ids_root()
}

/// Drops privileges to `uid`/`gid`, optionally chrooting into `chroot_dir`
/// first (`""` and `"/"` disable the chroot).
///
/// On success returns the chroot failure, if any; the caller decides whether
/// a failed chroot is fatal. An `Err` means the drop itself failed and the
/// process is in an indeterminate state; the caller must treat it as fatal.
///
/// The drop is verified after the fact: all four IDs must be non-zero,
/// `setuid(0)` and `setgid(0)` must fail, and no capabilities may remain.
pub(crate) fn drop_privileges(
    uid: libc::uid_t,
    gid: libc::gid_t,
    chroot_dir: &str,
    ban_suid: bool,
    anchor: &mut ChrootAnchor,
) -> ServiceResult<Option<ServiceError>> {
    if uid == 0 || gid == 0 {
        return Err(ServiceError::PrivilegeDrop(
            "refusing UID 0 or GID 0 as a target identity".to_owned(),
        ));
    }

    let mut gids = ident::extra_gids(gid)?;
    gids.push(gid);

    // Securebits are attempted before anything that can fail for real:
    // they only stick when we are (still) root, and running un-privileged
    // must not abort the drop.
    #[cfg(target_os = "linux")]
    if ban_suid {
        if let Err(err) =
            set_securebits(SECBIT_NOROOT | SECBIT_NOROOT_LOCKED | SECBIT_KEEP_CAPS_LOCKED)
        {
            log::debug!("cannot set securebits (continuing): {}", err);
        }
    }

    let chroot_err = anchor.try_chroot(chroot_dir).err();

    setgroups(&gids)?;
    setresgid(gid, gid, gid)?;
    setresuid(uid, uid, uid)?;

    std::env::set_current_dir("/")?;

    // Safety net: a drop that technically succeeded may still leave
    // capabilities behind. Clear them so verification judges the real state.
    if let Err(err) = drop_all_capabilities() {
        log::warn!("cannot drop capabilities before verification: {}", err);
    }
    verify_dropped()?;

    if ban_suid {
        if let Err(err) = set_no_new_privs() {
            log::debug!("cannot set NO_NEW_PRIVS (continuing): {}", err);
        }
    }

    Ok(chroot_err)
}

fn verify_dropped() -> ServiceResult<()> {
    if ids_root() {
        return Err(ServiceError::PrivilegeVerify(
            "a UID or GID of the process is still zero",
        ));
    }
    if setuid(0).is_ok() {
        return Err(ServiceError::PrivilegeVerify("setuid(0) still succeeds"));
    }
    if setgid(0).is_ok() {
        return Err(ServiceError::PrivilegeVerify("setgid(0) still succeeds"));
    }
    if has_any_capability() {
        return Err(ServiceError::PrivilegeVerify(
            "the process still holds capabilities",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_detection_is_consistent() {
        if unsafe { libc::getuid() } == 0 {
            assert!(is_root());
        }
        if !PLATFORM_SUPPORTS_CAPS {
            assert!(!has_any_capability());
        }
    }

    #[test]
    fn zero_target_is_rejected() {
        let mut anchor = ChrootAnchor::new();
        match drop_privileges(0, 0, "", true, &mut anchor) {
            Err(ServiceError::PrivilegeDrop(_)) => {}
            other => panic!("expected PrivilegeDrop, got {:?}", other),
        }
        match drop_privileges(1000, 0, "", true, &mut anchor) {
            Err(ServiceError::PrivilegeDrop(_)) => {}
            other => panic!("expected PrivilegeDrop, got {:?}", other),
        }
    }

    #[cfg(all(target_os = "linux", feature = "caps"))]
    #[test]
    fn capability_inspection_runs() {
        // Whatever the privilege level of the test run, inspection must not
        // disagree with itself.
        let before = has_any_capability();
        if !before {
            assert!(drop_all_capabilities().is_ok());
            assert!(!has_any_capability());
        }
    }
}
