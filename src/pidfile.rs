//! PID file creation and locking.
//!
//! The file is held open with an advisory write lock for the whole life of
//! the process, so "is the daemon running" checks can simply probe the
//! lock instead of trusting a stale PID.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::mem;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ServiceError, ServiceResult};

// At most one PID file may be open at any time, process-wide.
static PID_FILE_OPEN: AtomicBool = AtomicBool::new(false);

/// An open, locked PID file. Dropping the handle unlinks the file and
/// releases the lock.
#[derive(Debug)]
pub struct PidFile {
    file: File,
    path: PathBuf,
}

impl PidFile {
    /// Creates or adopts the file at `path`, takes an exclusive advisory
    /// write lock over its whole length and writes the current PID followed
    /// by a newline.
    ///
    /// While the handle exists the path is guaranteed to name the very file
    /// the lock covers; the open is retried whenever a concurrent unlink
    /// wins the race. Fails with [`ServiceError::PidFileBusy`] when another
    /// process holds the lock.
    pub fn open(path: &Path) -> ServiceResult<PidFile> {
        if PID_FILE_OPEN.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::Config(
                "a PID file is already open in this process".to_owned(),
            ));
        }

        Self::open_inner(path).inspect_err(|_| PID_FILE_OPEN.store(false, Ordering::SeqCst))
    }

    fn open_inner(path: &Path) -> ServiceResult<PidFile> {
        let mut file = open_and_lock(path)?;
        file.set_len(0)?;
        writeln!(file, "{}", process::id())?;

        Ok(PidFile {
            file,
            path: path.to_owned(),
        })
    }

    /// The canonical path the file was opened under.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        // Unlink before the lock is released so no window exists in which
        // another starter adopts a file we are about to delete.
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("cannot remove PID file {}: {}", self.path.display(), err);
        }
        PID_FILE_OPEN.store(false, Ordering::SeqCst);
    }
}

fn open_and_lock(path: &Path) -> ServiceResult<File> {
    loop {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
        {
            Ok(f) => f,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                match OpenOptions::new().read(true).write(true).open(path) {
                    Ok(f) => f,
                    // Unlinked between the two opens; start over.
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        lock_whole_file(&file)?;

        // The lock is only meaningful if the path still names the file we
        // locked; a racing unlink leaves us holding a ghost.
        let fd_meta = file.metadata()?;
        let path_meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        if fd_meta.ino() != path_meta.ino() {
            continue;
        }

        return Ok(file);
    }
}

fn lock_whole_file(file: &File) -> ServiceResult<()> {
    let mut fl: libc::flock = unsafe { mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start and l_len stay zero: the lock covers the whole file.

    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &fl) } < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EACCES) | Some(libc::EAGAIN) => Err(ServiceError::PidFileBusy),
            _ => Err(err.into()),
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // The single-open guard is process-wide, so these tests cannot overlap.
    static SERIAL: Mutex<()> = Mutex::new(());

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> TempDir {
            let dir =
                std::env::temp_dir().join(format!("service-forge-{}-{}", tag, process::id()));
            fs::create_dir_all(&dir).unwrap();
            TempDir(dir)
        }

        fn path(&self, name: &str) -> PathBuf {
            self.0.join(name)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn writes_pid_and_unlinks_on_drop() {
        let _serial = SERIAL.lock().unwrap();
        let tmp = TempDir::new("pidfile-write");
        let path = tmp.path("svc.pid");

        {
            let pf = PidFile::open(&path).unwrap();
            assert_eq!(pf.path(), path.as_path());
            let contents = fs::read_to_string(&path).unwrap();
            assert_eq!(contents, format!("{}\n", process::id()));
        }
        assert!(!path.exists());
    }

    #[test]
    fn adopts_a_preexisting_file() {
        let _serial = SERIAL.lock().unwrap();
        let tmp = TempDir::new("pidfile-adopt");
        let path = tmp.path("stale.pid");
        fs::write(&path, "99999\n").unwrap();

        let _pf = PidFile::open(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, format!("{}\n", process::id()));
    }

    #[test]
    fn second_open_in_the_same_process_is_an_error() {
        let _serial = SERIAL.lock().unwrap();
        let tmp = TempDir::new("pidfile-double");
        let first = PidFile::open(&tmp.path("a.pid")).unwrap();

        match PidFile::open(&tmp.path("b.pid")) {
            Err(ServiceError::Config(_)) => {}
            other => panic!("expected Config error, got {:?}", other),
        }
        drop(first);

        // Releasing the first handle makes opening legal again.
        let _second = PidFile::open(&tmp.path("b.pid")).unwrap();
    }
}
