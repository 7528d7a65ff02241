//! # ServiceForge
//!
//! **ServiceForge** wraps all the complexity of writing long-running daemons
//! in Rust while integrating with the operating system's service management
//! facilities: systemd's notify protocol and signal conventions on UNIX,
//! the Service Control Manager on Windows.
//!
//! The library owns three jobs so the application does not have to:
//! turning an ordinary process into a well-behaved daemon, reducing the
//! process's authority before the payload begins serving (setgroups /
//! setresgid / setresuid, chroot, capability drop and suid lockout,
//! executed in the safe order and verified afterwards), and coordinating
//! an orderly stop initiated by the operating system.
//!
//! A minimal service:
//!
//! ```no_run
//! use service_forge::{Config, ServiceInfo};
//!
//! ServiceInfo::new("foobar")
//!     .title("Foobar Web Server")
//!     .config(Config::default())
//!     .run_fn(|mgr| {
//!         // Initialization requiring root happens here.
//!         mgr.drop_privileges()?;
//!         mgr.set_started();
//!         mgr.set_status("foobar: running ok");
//!         mgr.stop_signal().wait();
//!         // Teardown.
//!         Ok(())
//!     })
//!     .main_exit();
//! ```

#[cfg(unix)]
pub mod daemonize;
mod error;
#[cfg(unix)]
pub mod ident;
mod manager;
#[cfg(unix)]
pub mod pidfile;
#[cfg(unix)]
pub mod privs;
mod service;
mod sys;
#[cfg(unix)]
pub mod systemd;

// Re-export the service API flat; the building blocks stay addressable
// through their modules.
pub use error::{ServiceError, ServiceResult};
pub use manager::{Manager, Runnable, StatusSource, StopSignal};
pub use service::{using_platform, Config, ServiceInfo};

#[cfg(unix)]
pub use daemonize::{args, ChrootAnchor, EMPTY_CHROOT_PATH};
#[cfg(unix)]
pub use pidfile::PidFile;

#[cfg(windows)]
pub use sys::EMPTY_CHROOT_PATH;

/// The argv this process was started with.
#[cfg(windows)]
pub fn args() -> Vec<std::ffi::OsString> {
    std::env::args_os().collect()
}
