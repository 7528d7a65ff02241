//! Service description and the supervisor event loop.

use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

use crate::error::{ServiceError, ServiceResult};
use crate::manager::{Event, Ihandler, Manager, Runnable, StatusSource, TitleHook};

/// Configuration variables which control how a service is run. Generally
/// parsed by the application from its command line or config file; this
/// crate does no parsing of its own.
///
/// Some fields only apply to one platform; they exist on every platform so
/// application config code stays portable. Use [`using_platform`] to check
/// whether a field currently applies.
#[derive(Debug, Default, Clone)]
pub struct Config {
    /// If non-empty, CPU profiling to the given file is requested. Best
    /// effort and outside the supervision core; this build logs that it is
    /// unsupported.
    pub cpu_profile: String,

    /// (Unix) UID or username to run as. Empty disables privilege
    /// dropping.
    pub uid: String,

    /// (Unix) GID or group name used when dropping privileges. If empty
    /// while `uid` is set, the primary group of that UID is looked up.
    pub gid: String,

    /// (Unix) Run as a daemon (does not fork): remaps stdio to /dev/null,
    /// calls setsid, clears the umask and moves to `/`.
    pub daemon: bool,

    /// (Unix) Fork into the background by re-executing. Implies `daemon`.
    pub fork: bool,

    /// (Unix) Keep stderr open when daemonizing.
    pub stderr: bool,

    /// (Unix) If non-empty, a PID file is written here and held under a
    /// write lock for the life of the process.
    pub pidfile: String,

    /// (Unix) Directory to chroot into; `"/"` disables. Only honored when
    /// privilege dropping is enabled.
    pub chroot: String,

    /// (Windows) One-shot service control command: `install`, `remove`,
    /// `start` or `stop`. Empty runs the service normally.
    pub command: String,
}

/// Returns whether a platform annotation (`""`, `"unix"`, `"windows"`)
/// applies to the current build. The empty annotation applies everywhere.
pub fn using_platform(name: &str) -> bool {
    name.is_empty() || name == crate::sys::PLATFORM_NAME
}

type RunFn = Box<dyn FnOnce(Arc<dyn Manager>) -> ServiceResult<()> + Send>;
type NewFn =
    Box<dyn FnOnce() -> ServiceResult<(Box<dyn Runnable>, Option<Receiver<String>>)> + Send>;

pub(crate) enum Payload {
    Run(RunFn),
    New(NewFn),
}

/// An instantiable service: identity, policy knobs, runtime configuration
/// and the payload, assembled with a builder and run with
/// [`ServiceInfo::run`] or [`ServiceInfo::main_exit`].
pub struct ServiceInfo {
    pub(crate) name: String,
    pub(crate) title: String,
    pub(crate) description: String,
    pub(crate) allow_root: bool,
    pub(crate) default_chroot: String,
    pub(crate) no_ban_suid: bool,
    pub(crate) config: Config,
    pub(crate) payload: Option<Payload>,
    pub(crate) title_hook: Option<TitleHook>,
}

impl ServiceInfo {
    /// Creates a service description with the given codename (e.g.
    /// "foobar"). The name must not be empty.
    ///
    /// # Defaults
    /// - `title`: the name
    /// - `description`: the title
    /// - `allow_root`: false
    /// - `default_chroot`: `"/"` (no chroot)
    pub fn new(name: &str) -> Self {
        ServiceInfo {
            name: name.to_owned(),
            title: String::new(),
            description: String::new(),
            allow_root: false,
            default_chroot: String::new(),
            no_ban_suid: false,
            config: Config::default(),
            payload: None,
            title_hook: None,
        }
    }

    /// Sets the friendly name, e.g. "Foobar Web Server".
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.to_owned();
        self
    }

    /// Sets the single-line service description.
    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_owned();
        self
    }

    /// May the service run with root authority? If false, the service
    /// refuses to continue past the privilege drop while any UID/GID is
    /// zero or any capability is held.
    pub fn allow_root(mut self, allow: bool) -> Self {
        self.allow_root = allow;
        self
    }

    /// Path used as the chroot when the runtime configuration does not
    /// specify one. Use [`crate::EMPTY_CHROOT_PATH`] if the service never
    /// touches the filesystem once started.
    pub fn default_chroot(mut self, path: &str) -> Self {
        self.default_chroot = path.to_owned();
        self
    }

    /// Set if the service must retain the ability to execute suid
    /// binaries; disables the NO_NEW_PRIVS/securebits hardening.
    pub fn no_ban_suid(mut self, no_ban: bool) -> Self {
        self.no_ban_suid = no_ban;
        self
    }

    /// Installs the runtime configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Hook receiving the current status line, typically used to update
    /// the process title. Defaults to a no-op.
    pub fn title_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.title_hook = Some(Box::new(hook));
        self
    }

    /// Provides the payload as a single blocking entry point. It must not
    /// return until the service has stopped: call
    /// [`Manager::drop_privileges`], then [`Manager::set_started`], then
    /// block until [`Manager::stop_signal`] fires.
    pub fn run_fn<F>(mut self, run: F) -> Self
    where
        F: FnOnce(Arc<dyn Manager>) -> ServiceResult<()> + Send + 'static,
    {
        self.payload = Some(Payload::Run(Box::new(run)));
        self
    }

    /// Provides the payload as a [`Runnable`] constructor. The runnable is
    /// instantiated, privileges are dropped, `start` is called, and `stop`
    /// is called once the stop signal fires.
    pub fn runnable<R, F>(mut self, new: F) -> Self
    where
        R: Runnable + 'static,
        F: FnOnce() -> ServiceResult<R> + Send + 'static,
    {
        self.payload = Some(Payload::New(Box::new(move || {
            let runnable = new()?;
            Ok((Box::new(runnable) as Box<dyn Runnable>, None))
        })));
        self
    }

    /// Like [`ServiceInfo::runnable`], for runnables that also implement
    /// [`StatusSource`]. Their status lines are forwarded to the
    /// supervisor, prefixed with the service name.
    pub fn runnable_with_status<R, F>(mut self, new: F) -> Self
    where
        R: Runnable + StatusSource + 'static,
        F: FnOnce() -> ServiceResult<R> + Send + 'static,
    {
        self.payload = Some(Payload::New(Box::new(move || {
            let mut runnable = new()?;
            let status = runnable.status_chan();
            Ok((Box::new(runnable) as Box<dyn Runnable>, Some(status)))
        })));
        self
    }

    /// Runs the service to completion: housekeeping, daemonization and the
    /// lifecycle loop. Returns once the payload has returned.
    pub fn run(mut self) -> ServiceResult<()> {
        if self.name.is_empty() {
            return Err(ServiceError::Config(
                "service name must be specified".to_owned(),
            ));
        }
        self.apply_defaults();
        if self.payload.is_none() {
            return Err(ServiceError::Config(
                "either a run function or a runnable must be provided".to_owned(),
            ));
        }
        if !self.config.cpu_profile.is_empty() {
            log::warn!("cpu_profile is configured but profiling is not supported by this build");
        }

        crate::sys::service_main(self)
    }

    fn apply_defaults(&mut self) {
        if self.title.is_empty() {
            self.title = self.name.clone();
        }
        if self.description.is_empty() {
            self.description = self.title.clone();
        }
    }

    /// Runs the service and exits the process: 0 on a clean stop, 1 with a
    /// single diagnostic line on stderr otherwise. Call this directly from
    /// `main`.
    pub fn main_exit(self) -> ! {
        match self.run() {
            Ok(()) => process::exit(0),
            Err(err) => {
                eprintln!("Error in service: {}", err);
                process::exit(1)
            }
        }
    }
}

// Wraps a runnable constructor into the standard run function: construct,
// drop privileges, start, report started, then wait for the stop signal
// while forwarding any status lines the runnable emits.
pub(crate) fn synthesize_run(name: String, new: NewFn) -> RunFn {
    Box::new(move |mgr: Arc<dyn Manager>| {
        let (mut runnable, status_rx) = new()?;

        mgr.drop_privileges()?;
        runnable.start()?;
        mgr.set_started();
        mgr.set_status(&format!("{}: running ok", name));

        let forwarder = status_rx.map(|rx| {
            let fwd_mgr = Arc::clone(&mgr);
            let fwd_name = name.clone();
            thread::spawn(move || {
                for line in rx.iter() {
                    fwd_mgr.set_status(&format!("{}: {}", fwd_name, line));
                }
            })
        });

        mgr.stop_signal().wait();
        let result = runnable.stop();

        // Dropping the runnable closes its sender, which ends the
        // forwarder.
        drop(runnable);
        if let Some(handle) = forwarder {
            let _ = handle.join();
        }

        result
    })
}

/// The lifecycle loop shared by the unix path and the interactive windows
/// path: runs the payload on its own thread and multiplexes stop requests,
/// the started notification, status changes and payload termination.
pub(crate) fn run_interactively(mut info: ServiceInfo, systemd: bool) -> ServiceResult<()> {
    let title_hook = info.title_hook.take();
    let payload = info.payload.take();

    let (tx, rx) = mpsc::channel();
    let handler = Arc::new(Ihandler::new(&info, title_hook, tx, systemd));

    let run_fn = match payload {
        Some(Payload::Run(f)) => f,
        Some(Payload::New(n)) => synthesize_run(info.name.clone(), n),
        None => unreachable!("payload presence is checked in run()"),
    };

    let payload_mgr: Arc<dyn Manager> = handler.clone();
    let payload_handler = handler.clone();
    thread::Builder::new()
        .name("service-payload".to_owned())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| run_fn(payload_mgr)))
                .unwrap_or_else(|_| {
                    Err(ServiceError::Payload("service payload panicked".to_owned()))
                });
            payload_handler.send(Event::Done(result));
        })?;

    crate::sys::subscribe_stop_events(&handler)?;

    let mut stopping = false;
    loop {
        let event = match rx.recv() {
            Ok(event) => event,
            Err(_) => return Ok(()),
        };

        match event {
            Event::Stop => {
                // Repeated signals coalesce into a single stop.
                if !stopping {
                    stopping = true;
                    handler.stop.fire();
                    handler.publish_status();
                }
            }
            Event::Started => {
                if !handler.started.swap(true, Ordering::SeqCst) {
                    handler.publish_status();
                }
            }
            Event::StatusChange => {
                handler.status_pending.store(false, Ordering::SeqCst);
                handler.publish_status();
            }
            Event::Done(result) => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_annotations() {
        assert!(using_platform(""));
        #[cfg(unix)]
        {
            assert!(using_platform("unix"));
            assert!(!using_platform("windows"));
        }
        #[cfg(windows)]
        {
            assert!(using_platform("windows"));
            assert!(!using_platform("unix"));
        }
    }

    #[test]
    fn empty_name_is_rejected() {
        let err = ServiceInfo::new("").run_fn(|_mgr| Ok(())).run();
        match err {
            Err(ServiceError::Config(msg)) => assert!(msg.contains("name")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn missing_payload_is_rejected() {
        match ServiceInfo::new("nopayload").run() {
            Err(ServiceError::Config(msg)) => assert!(msg.contains("run function")),
            other => panic!("expected Config error, got {:?}", other),
        }
    }

    #[test]
    fn title_and_description_default_chain() {
        let mut info = ServiceInfo::new("foobar");
        info.apply_defaults();
        assert_eq!(info.title, "foobar");
        assert_eq!(info.description, "foobar");

        let mut info = ServiceInfo::new("foobar").title("Foobar Web Server");
        info.apply_defaults();
        assert_eq!(info.description, "Foobar Web Server");
    }
}
