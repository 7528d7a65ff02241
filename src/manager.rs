//! The payload-facing contracts: the manager handed to a running payload,
//! the runnable abstraction and its optional status upgrade, and the
//! supervisor-side handler state behind them.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Condvar, Mutex};

#[cfg(unix)]
use crate::daemonize::ChrootAnchor;
use crate::error::ServiceResult;
use crate::service::ServiceInfo;

/// One-shot stop notification. Once fired it stays fired; every later read
/// observes it fired.
#[derive(Debug)]
pub struct StopSignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub(crate) fn new() -> Self {
        StopSignal {
            fired: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// True once the supervisor has requested a stop.
    pub fn is_fired(&self) -> bool {
        *self.fired.lock().unwrap()
    }

    /// Blocks until a stop is requested. Returns immediately if one
    /// already was.
    pub fn wait(&self) {
        let mut fired = self.fired.lock().unwrap();
        while !*fired {
            fired = self.cond.wait(fired).unwrap();
        }
    }

    pub(crate) fn fire(&self) {
        let mut fired = self.fired.lock().unwrap();
        *fired = true;
        self.cond.notify_all();
    }
}

/// The interface between the service library and the application payload.
/// The payload calls these methods at the documented points in its
/// lifecycle.
pub trait Manager: Send + Sync {
    /// Must be called when the service is ready to drop privileges, before
    /// [`Manager::set_started`]. Idempotent once it has succeeded.
    fn drop_privileges(&self) -> ServiceResult<()>;

    /// Must be called exactly once, after [`Manager::drop_privileges`] has
    /// returned success, when the payload has finished starting.
    ///
    /// # Panics
    ///
    /// Calling this before privileges were dropped is a programming error
    /// and panics.
    fn set_started(&self);

    /// The payload must stop when this signal fires.
    fn stop_signal(&self) -> &StopSignal;

    /// Provides a single line of information on the current status of the
    /// service. Overwrites the previous status.
    fn set_status(&self, status: &str);

    /// Translates an absolute pre-drop path into the path that addresses
    /// the same file now, accounting for any chroot entered during
    /// [`Manager::drop_privileges`]. Returns `None` for paths the process
    /// can no longer address. Before a chroot (and on platforms without
    /// one) paths come back unchanged.
    fn relativize(&self, path: &Path) -> Option<PathBuf>;
}

/// A payload expressed as start/stop calls instead of a blocking run
/// function. Both methods must return.
pub trait Runnable: Send {
    /// Starts the runnable. Initialization requiring root must already
    /// have happened: privileges are dropped before this is called.
    fn start(&mut self) -> ServiceResult<()>;

    /// Stops the runnable.
    fn stop(&mut self) -> ServiceResult<()>;
}

/// Upgrade interface for runnables that emit status lines. Implementing it
/// guarantees the channel is consumed until [`Runnable::stop`] is called.
pub trait StatusSource {
    /// Hands the receiving end of the status channel to the supervisor.
    fn status_chan(&mut self) -> Receiver<String>;
}

pub(crate) type TitleHook = Box<dyn Fn(&str) + Send + Sync>;

/// Everything the supervisor loop multiplexes over, funneled into a single
/// channel so the loop can block on one receiver.
pub(crate) enum Event {
    /// SIGINT/SIGTERM, or an SCM stop/shutdown control, or console Ctrl+C.
    Stop,
    /// The payload called `set_started`.
    Started,
    /// The status line changed; coalesced to at most one pending event.
    StatusChange,
    /// The payload returned.
    Done(ServiceResult<()>),
}

pub(crate) struct Ihandler {
    pub(crate) allow_root: bool,
    pub(crate) no_ban_suid: bool,
    pub(crate) default_chroot: String,
    pub(crate) cfg_uid: String,
    pub(crate) cfg_gid: String,
    pub(crate) cfg_chroot: String,

    pub(crate) stop: StopSignal,
    events: Mutex<Sender<Event>>,
    pub(crate) status: Mutex<String>,
    pub(crate) status_pending: AtomicBool,
    pub(crate) started: AtomicBool,
    pub(crate) dropped: AtomicBool,
    #[cfg(unix)]
    pub(crate) anchor: Mutex<ChrootAnchor>,
    pub(crate) systemd: bool,
    title_hook: Option<TitleHook>,
}

impl Ihandler {
    pub(crate) fn new(
        info: &ServiceInfo,
        title_hook: Option<TitleHook>,
        events: Sender<Event>,
        systemd: bool,
    ) -> Ihandler {
        Ihandler {
            allow_root: info.allow_root,
            no_ban_suid: info.no_ban_suid,
            default_chroot: info.default_chroot.clone(),
            cfg_uid: info.config.uid.clone(),
            cfg_gid: info.config.gid.clone(),
            cfg_chroot: info.config.chroot.clone(),
            stop: StopSignal::new(),
            events: Mutex::new(events),
            status: Mutex::new(String::new()),
            status_pending: AtomicBool::new(false),
            started: AtomicBool::new(false),
            dropped: AtomicBool::new(false),
            #[cfg(unix)]
            anchor: Mutex::new(ChrootAnchor::new()),
            systemd,
            title_hook,
        }
    }

    pub(crate) fn send(&self, event: Event) {
        // The receiver only goes away when the supervisor is done; at that
        // point notifications are moot.
        let _ = self.events.lock().unwrap().send(event);
    }

    /// Pushes the current status out to the init daemon and the process
    /// title hook. Both are best-effort.
    pub(crate) fn publish_status(&self) {
        let status = self.status.lock().unwrap().clone();

        if self.systemd {
            #[cfg(unix)]
            {
                let mut state = String::new();
                if self.started.load(Ordering::SeqCst) {
                    state.push_str("READY=1\n");
                }
                if !status.is_empty() {
                    state.push_str("STATUS=");
                    state.push_str(&status);
                    state.push('\n');
                }
                if !state.is_empty() {
                    let _ = crate::systemd::notify(&state);
                }
            }
        }

        if !status.is_empty() {
            if let Some(hook) = &self.title_hook {
                hook(&status);
            }
        }
    }
}

impl Manager for Ihandler {
    fn drop_privileges(&self) -> ServiceResult<()> {
        crate::sys::drop_privileges(self)
    }

    fn set_started(&self) {
        if !self.dropped.load(Ordering::SeqCst) {
            panic!("service must call drop_privileges before calling set_started");
        }
        self.send(Event::Started);
    }

    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn set_status(&self, status: &str) {
        *self.status.lock().unwrap() = status.to_owned();
        // Coalesce: while a notification is pending, further pokes are
        // dropped and the supervisor reads the freshest string anyway.
        if !self.status_pending.swap(true, Ordering::SeqCst) {
            self.send(Event::StatusChange);
        }
    }

    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        #[cfg(unix)]
        {
            self.anchor.lock().unwrap().relativize(path)
        }
        #[cfg(windows)]
        {
            Some(path.to_path_buf())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Config;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn test_handler() -> (Ihandler, mpsc::Receiver<Event>) {
        let info = ServiceInfo::new("testsvc")
            .allow_root(true)
            .config(Config::default());
        let (tx, rx) = mpsc::channel();
        (Ihandler::new(&info, None, tx, false), rx)
    }

    #[test]
    fn stop_signal_latches() {
        let stop = StopSignal::new();
        assert!(!stop.is_fired());
        stop.fire();
        assert!(stop.is_fired());
        stop.fire();
        assert!(stop.is_fired());
        // And wait() returns immediately once fired.
        stop.wait();
    }

    #[test]
    fn stop_signal_wakes_a_waiter() {
        let stop = std::sync::Arc::new(StopSignal::new());
        let waiter_stop = stop.clone();
        let waiter = thread::spawn(move || waiter_stop.wait());
        thread::sleep(Duration::from_millis(20));
        stop.fire();
        waiter.join().unwrap();
    }

    #[test]
    fn status_notifications_coalesce() {
        let (h, rx) = test_handler();

        h.set_status("one");
        h.set_status("two");
        h.set_status("three");

        // Exactly one notification is pending, carrying the latest string.
        match rx.try_recv() {
            Ok(Event::StatusChange) => {}
            _ => panic!("expected one StatusChange"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(h.status.lock().unwrap().as_str(), "three");

        // Draining re-arms the notification.
        h.status_pending.store(false, Ordering::SeqCst);
        h.set_status("four");
        assert!(matches!(rx.try_recv(), Ok(Event::StatusChange)));
    }

    #[test]
    #[should_panic(expected = "drop_privileges")]
    fn set_started_without_drop_panics() {
        let (h, _rx) = test_handler();
        h.set_started();
    }

    #[test]
    fn set_started_after_drop_notifies() {
        let (h, rx) = test_handler();
        h.dropped.store(true, Ordering::SeqCst);
        h.set_started();
        assert!(matches!(rx.try_recv(), Ok(Event::Started)));
    }

    #[test]
    fn relativize_is_identity_before_any_chroot() {
        let (h, _rx) = test_handler();
        let mgr: &dyn Manager = &h;
        assert_eq!(
            mgr.relativize(Path::new("/etc/hosts")),
            Some(PathBuf::from("/etc/hosts"))
        );
    }
}
