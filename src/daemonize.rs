//! Helpers for turning the current process into a UNIX-style daemon:
//! stdio remapping, session detachment, pseudo-fork by re-execution, and
//! chroot bookkeeping.

use std::env;
use std::ffi::{CString, OsString};
use std::fs::OpenOptions;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use crate::error::{ServiceError, ServiceResult};

/// Argument appended to argv when re-executing ourselves, telling the new
/// copy not to re-execute itself again. A running parent and its child must
/// agree on this token, so it never changes.
const FORKED_ARG: &str = "$*_FORKED_*$";

/// A directory the platform guarantees is empty, suitable as a chroot for
/// services that do not touch the filesystem once started. The FHS provides
/// `/var/empty`.
pub const EMPTY_CHROOT_PATH: &str = "/var/empty";

// Resolved once, before any chdir or chroot can invalidate a relative
// argv[0].
fn abs_exe_path() -> &'static Path {
    static EXE: OnceLock<PathBuf> = OnceLock::new();
    EXE.get_or_init(|| {
        env::current_exe().unwrap_or_else(|_| {
            let arg0 = PathBuf::from(env::args_os().next().unwrap_or_default());
            if arg0.is_absolute() {
                arg0
            } else {
                env::current_dir().map(|d| d.join(&arg0)).unwrap_or(arg0)
            }
        })
    })
}

fn strip_sentinel(mut argv: Vec<OsString>) -> Vec<OsString> {
    while argv.last().and_then(|a| a.to_str()) == Some(FORKED_ARG) {
        argv.pop();
    }
    argv
}

/// The argv this process was started with, minus the internal fork marker.
/// Payloads should read their arguments from here rather than from
/// `std::env::args`, which still shows the marker in a re-executed child.
pub fn args() -> Vec<OsString> {
    strip_sentinel(env::args_os().collect())
}

/// Outcome of [`fork`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The original process. It should exit with status 0.
    Parent,
    /// The re-executed copy, which carries on as the daemon.
    Child,
}

/// Pseudo-forks by re-executing the current binary with the same argv plus
/// a trailing marker argument. Returns [`ForkOutcome::Child`] if this
/// process already is the re-executed copy. Otherwise spawns the copy with
/// stdio inherited, does not wait for it, and returns
/// [`ForkOutcome::Parent`].
pub fn fork() -> ServiceResult<ForkOutcome> {
    let raw: Vec<OsString> = env::args_os().collect();
    if raw.last().and_then(|a| a.to_str()) == Some(FORKED_ARG) {
        return Ok(ForkOutcome::Child);
    }

    let mut cmd = Command::new(abs_exe_path());
    cmd.args(strip_sentinel(raw).into_iter().skip(1));
    cmd.arg(FORKED_ARG);
    cmd.spawn()?;

    Ok(ForkOutcome::Parent)
}

/// Initialises a daemon with recommended values: clears the umask and
/// changes the working directory to `/`. Idempotent.
pub fn init() -> ServiceResult<()> {
    unsafe {
        libc::umask(0);
    }
    env::set_current_dir("/")?;
    Ok(())
}

/// Duplicates `src` onto `dst`, closing whatever `dst` referred to in the
/// same step. Uses dup3 on Linux, where dup2 is absent from newer ABIs
/// such as arm64.
pub fn dup_fd(src: RawFd, dst: RawFd) -> ServiceResult<()> {
    #[cfg(target_os = "linux")]
    let ret = unsafe { libc::dup3(src, dst, 0) };
    #[cfg(not(target_os = "linux"))]
    let ret = unsafe { libc::dup2(src, dst) };

    if ret < 0 {
        return Err(ServiceError::last_syscall("dup2"));
    }
    Ok(())
}

/// Daemonizes without forking: remaps stdin, stdout and (unless
/// `keep_stderr` is set) stderr to `/dev/null`, starts a new session and
/// applies [`init`].
///
/// Must run before privileges are dropped: a chroot may not contain
/// `/dev/null`.
pub fn daemonize(keep_stderr: bool) -> ServiceResult<()> {
    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let null_fd = null.as_raw_fd();

    dup_fd(null_fd, libc::STDIN_FILENO)?;
    dup_fd(null_fd, libc::STDOUT_FILENO)?;
    if !keep_stderr {
        dup_fd(null_fd, libc::STDERR_FILENO)?;
    }

    // Fails if we already lead a process group; not a problem.
    unsafe {
        libc::setsid();
    }

    init()
}

/// Cumulative path under which the process has been chrooted, `/` if it
/// never has been. A chroot cannot be undone, so the anchor only grows.
#[derive(Debug)]
pub struct ChrootAnchor {
    anchor: PathBuf,
}

impl ChrootAnchor {
    pub fn new() -> Self {
        ChrootAnchor {
            anchor: PathBuf::from("/"),
        }
    }

    /// The path under which the process is currently rooted.
    pub fn anchor(&self) -> &Path {
        &self.anchor
    }

    /// Translates an absolute pre-chroot path into the path addressing the
    /// same file after the chroot. Returns `None` for paths outside the
    /// anchor, which can no longer be addressed.
    pub fn relativize(&self, path: &Path) -> Option<PathBuf> {
        let rel = path.strip_prefix(&self.anchor).ok()?;
        Some(Path::new("/").join(rel))
    }

    /// Chroots into `path` and extends the anchor. Non-absolute paths are
    /// refused; `""` and `"/"` disable the chroot.
    pub(crate) fn try_chroot(&mut self, path: &str) -> ServiceResult<()> {
        if path.is_empty() || path == "/" {
            return Ok(());
        }
        if !Path::new(path).is_absolute() {
            return Err(ServiceError::Chroot(format!(
                "chroot path must be absolute: {}",
                path
            )));
        }

        // Force lazily-loaded resolver configuration (/etc/hosts,
        // /etc/resolv.conf) into memory while those files are still
        // reachable. The dial itself is expected to fail.
        warm_resolver();

        let cpath = CString::new(path)
            .map_err(|_| ServiceError::Chroot(format!("invalid chroot path: {}", path)))?;
        if unsafe { libc::chroot(cpath.as_ptr()) } < 0 {
            return Err(ServiceError::Chroot(format!(
                "{}: {}",
                path,
                io::Error::last_os_error()
            )));
        }

        self.anchor = self.anchor.join(&path[1..]);
        Ok(())
    }
}

impl Default for ChrootAnchor {
    fn default() -> Self {
        Self::new()
    }
}

fn warm_resolver() {
    use std::net::UdpSocket;

    if let Ok(sock) = UdpSocket::bind("127.0.0.1:0") {
        let _ = sock.connect(("un-localhost", 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_stripped_even_when_repeated() {
        let argv = vec![
            OsString::from("/usr/bin/foobar"),
            OsString::from("--flag"),
            OsString::from(FORKED_ARG),
            OsString::from(FORKED_ARG),
        ];
        let cleaned = strip_sentinel(argv);
        assert_eq!(
            cleaned,
            vec![OsString::from("/usr/bin/foobar"), OsString::from("--flag")]
        );
    }

    #[test]
    fn sentinel_in_the_middle_is_payload_data() {
        let argv = vec![
            OsString::from("prog"),
            OsString::from(FORKED_ARG),
            OsString::from("tail"),
        ];
        assert_eq!(strip_sentinel(argv.clone()), argv);
    }

    #[test]
    fn fresh_anchor_is_root() {
        let anchor = ChrootAnchor::new();
        assert_eq!(anchor.anchor(), Path::new("/"));
        assert_eq!(
            anchor.relativize(Path::new("/etc/hosts")).unwrap(),
            Path::new("/etc/hosts")
        );
    }

    #[test]
    fn relativize_inside_and_outside_an_anchor() {
        let anchor = ChrootAnchor {
            anchor: PathBuf::from("/var/empty"),
        };
        assert_eq!(
            anchor.relativize(Path::new("/var/empty/run/x.sock")).unwrap(),
            Path::new("/run/x.sock")
        );
        assert_eq!(
            anchor.relativize(Path::new("/var/empty")).unwrap(),
            Path::new("/")
        );
        assert!(anchor.relativize(Path::new("/var/emptyish")).is_none());
        assert!(anchor.relativize(Path::new("/etc/hosts")).is_none());
    }

    #[test]
    fn relative_chroot_paths_are_refused() {
        let mut anchor = ChrootAnchor::new();
        match anchor.try_chroot("jail") {
            Err(ServiceError::Chroot(_)) => {}
            other => panic!("expected Chroot error, got {:?}", other),
        }
        // Disabled chroot leaves the anchor untouched.
        anchor.try_chroot("").unwrap();
        anchor.try_chroot("/").unwrap();
        assert_eq!(anchor.anchor(), Path::new("/"));
    }
}
