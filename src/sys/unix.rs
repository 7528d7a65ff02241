//! UNIX entry point: daemonization sequencing, the signal subscription and
//! the real privilege-drop pipeline behind the manager.

use std::path::Path;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::daemonize::{self, ForkOutcome};
use crate::error::{ServiceError, ServiceResult};
use crate::ident;
use crate::manager::{Event, Ihandler};
use crate::pidfile::PidFile;
use crate::privs;
use crate::service::{run_interactively, ServiceInfo};
use crate::systemd;

pub(crate) const PLATFORM_NAME: &str = "unix";

pub(crate) fn service_main(mut info: ServiceInfo) -> ServiceResult<()> {
    if info.config.fork {
        match daemonize::fork()? {
            ForkOutcome::Parent => process::exit(0),
            ForkOutcome::Child => {}
        }
        info.config.fork = false;
        info.config.daemon = true;
    }

    daemonize::init()?;

    // Probed after the fork so it is the surviving child that talks to the
    // notify socket. Under systemd with Type=notify the probe datagram
    // goes through and status reporting stays on for the rest of the run.
    let systemd = systemd::probe();

    if info.config.daemon || systemd {
        // systemd forwards stderr to the journal, so it stays open there
        // unless the configuration says otherwise.
        daemonize::daemonize(info.config.stderr || systemd)?;
    }

    let _pid_file = if info.config.pidfile.is_empty() {
        None
    } else {
        Some(PidFile::open(Path::new(&info.config.pidfile))?)
    };

    run_interactively(info, systemd)
}

/// Forwards SIGINT and SIGTERM into the supervisor loop. Delivery is
/// coalesced there; any number of signals cause at most one stop.
pub(crate) fn subscribe_stop_events(handler: &Arc<Ihandler>) -> ServiceResult<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handler = Arc::clone(handler);

    thread::Builder::new()
        .name("service-signals".to_owned())
        .spawn(move || {
            for _signal in signals.forever() {
                handler.send(Event::Stop);
            }
        })?;

    Ok(())
}

/// The real privilege drop, run on the payload thread when it calls
/// `Manager::drop_privileges`.
pub(crate) fn drop_privileges(h: &Ihandler) -> ServiceResult<()> {
    // The anchor mutex doubles as the serializer for concurrent calls.
    let mut anchor = h.anchor.lock().unwrap();
    if h.dropped.load(Ordering::SeqCst) {
        return Ok(());
    }

    let mut cfg_gid = h.cfg_gid.clone();
    if !h.cfg_uid.is_empty() && cfg_gid.is_empty() {
        let uid = ident::parse_uid(&h.cfg_uid)?;
        cfg_gid = ident::primary_gid_of(uid)?.to_string();
    }
    if h.cfg_uid.is_empty() != cfg_gid.is_empty() {
        return Err(ServiceError::Config(
            "either both or neither of the UID and GID must be specified".to_owned(),
        ));
    }

    let explicit_chroot = !h.cfg_chroot.is_empty() && h.cfg_chroot != "/";
    let chroot_path = if !h.cfg_chroot.is_empty() {
        h.cfg_chroot.as_str()
    } else if !h.default_chroot.is_empty() {
        h.default_chroot.as_str()
    } else {
        "/"
    };

    let target = if h.cfg_uid.is_empty() {
        None
    } else {
        Some((ident::parse_uid(&h.cfg_uid)?, ident::parse_gid(&cfg_gid)?))
    };

    match target {
        Some((uid, gid)) if uid > 0 => {
            let chroot_err =
                privs::drop_privileges(uid, gid, chroot_path, !h.no_ban_suid, &mut anchor)?;
            if let Some(err) = chroot_err {
                if explicit_chroot {
                    return Err(err);
                }
                log::warn!("default chroot not applied: {}", err);
            }
        }
        _ => {
            // No identity change requested (or UID 0, i.e. the current
            // identity). The suid lockout is still worth attempting.
            if !h.no_ban_suid {
                privs::harden_best_effort();
            }
            if explicit_chroot {
                return Err(ServiceError::Config(
                    "chrooting requires privilege dropping; specify a UID".to_owned(),
                ));
            }
        }
    }

    // Even without a UID switch the process may have been handed ambient
    // capabilities; shed them.
    privs::drop_all_capabilities()?;

    if !h.allow_root && privs::is_root() {
        return Err(ServiceError::PrivilegeVerify(
            "service must not run as root or with capabilities; run as a non-root user or configure a UID to drop to",
        ));
    }

    h.dropped.store(true, Ordering::SeqCst);
    Ok(())
}
