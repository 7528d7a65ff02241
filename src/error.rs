use std::fmt;
use std::io;

/// Custom error type for ServiceForge.
/// Provides specific details about why running the service failed.
#[derive(Debug)]
pub enum ServiceError {
    /// Standard IO errors (file creation, socket setup, etc.)
    Io(io::Error),
    /// A system call failed.
    Syscall { call: &'static str, errno: i32 },
    /// A user or group name has no entry in the system database.
    IdentityNotFound(String),
    /// The user/group database could not be queried at all.
    IdentityLookup(String),
    /// A mandatory step of the privilege drop failed. The process is in an
    /// indeterminate state and must not continue serving.
    PrivilegeDrop(String),
    /// The privilege drop appeared to succeed but residual authority remains.
    PrivilegeVerify(&'static str),
    /// Chrooting failed or the chroot path was unusable.
    Chroot(String),
    /// Another process holds the write lock on the PID file.
    PidFileBusy,
    /// The service configuration is inconsistent.
    Config(String),
    /// The service payload reported an error.
    Payload(String),
    /// (Windows) A service control manager API call failed.
    #[cfg(windows)]
    Windows { call: &'static str, code: u32 },
}

impl ServiceError {
    /// Builds a `Syscall` error from the calling thread's current errno.
    #[cfg(unix)]
    pub(crate) fn last_syscall(call: &'static str) -> Self {
        ServiceError::Syscall {
            call,
            errno: io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Io(err) => write!(f, "IO error: {}", err),
            ServiceError::Syscall { call, errno } => {
                write!(f, "syscall '{}' failed with errno {}", call, errno)
            }
            ServiceError::IdentityNotFound(what) => {
                write!(f, "identity not found: {}", what)
            }
            ServiceError::IdentityLookup(msg) => {
                write!(f, "identity lookup error: {}", msg)
            }
            ServiceError::PrivilegeDrop(msg) => {
                write!(f, "failed to drop privileges: {}", msg)
            }
            ServiceError::PrivilegeVerify(msg) => {
                write!(f, "privilege drop verification failed: {}", msg)
            }
            ServiceError::Chroot(msg) => write!(f, "failed to chroot: {}", msg),
            ServiceError::PidFileBusy => {
                write!(f, "PID file is locked by another process")
            }
            ServiceError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            ServiceError::Payload(msg) => write!(f, "service error: {}", msg),
            #[cfg(windows)]
            ServiceError::Windows { call, code } => {
                write!(f, "windows API '{}' failed with code {}", call, code)
            }
        }
    }
}

impl std::error::Error for ServiceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServiceError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for ServiceError {
    fn from(err: io::Error) -> Self {
        ServiceError::Io(err)
    }
}

/// A specialized Result type for ServiceForge operations.
pub type ServiceResult<T> = Result<T, ServiceError>;
