#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::{drop_privileges, service_main, subscribe_stop_events, PLATFORM_NAME};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::{drop_privileges, service_main, subscribe_stop_events, PLATFORM_NAME};
#[cfg(windows)]
pub use windows::EMPTY_CHROOT_PATH;
