//! End-to-end runs of the supervisor with in-process payloads.

#![cfg(unix)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use service_forge::{
    Config, Runnable, ServiceError, ServiceInfo, ServiceResult, StatusSource,
};

// Supervisor runs touch process-wide state (signal subscriptions, the
// working directory, the PID file guard), so they must not overlap.
static SERIAL: Mutex<()> = Mutex::new(());

fn setup() -> std::sync::MutexGuard<'static, ()> {
    let guard = SERIAL.lock().unwrap_or_else(|poison| poison.into_inner());
    // Keep the run out of systemd mode regardless of the environment the
    // tests were started from.
    unsafe {
        std::env::remove_var("NOTIFY_SOCKET");
    }
    guard
}

fn raise_sigterm_after(delay: Duration) {
    thread::spawn(move || {
        thread::sleep(delay);
        signal_hook::low_level::raise(signal_hook::consts::SIGTERM).unwrap();
    });
}

#[test]
fn lifecycle_completes_cleanly() {
    let _serial = setup();

    let reached_serving = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&reached_serving);

    ServiceInfo::new("t-clean")
        .allow_root(true)
        .config(Config::default())
        .run_fn(move |mgr| {
            mgr.drop_privileges()?;
            // Idempotent once it has succeeded.
            mgr.drop_privileges()?;
            // No chroot was configured, so paths are not displaced.
            assert_eq!(
                mgr.relativize(std::path::Path::new("/etc/hosts")),
                Some(std::path::PathBuf::from("/etc/hosts"))
            );
            mgr.set_started();
            mgr.set_status("t-clean: running ok");
            observed.store(true, Ordering::SeqCst);
            Ok(())
        })
        .run()
        .unwrap();

    assert!(reached_serving.load(Ordering::SeqCst));
}

#[test]
fn sigterm_stops_the_payload_exactly_once() {
    let _serial = setup();

    let wakeups = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&wakeups);

    raise_sigterm_after(Duration::from_millis(150));

    ServiceInfo::new("t-stop")
        .allow_root(true)
        .config(Config::default())
        .run_fn(move |mgr| {
            mgr.drop_privileges()?;
            mgr.set_started();

            mgr.stop_signal().wait();
            assert!(mgr.stop_signal().is_fired());
            // Monotonic: a second wait returns immediately.
            mgr.stop_signal().wait();
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .run()
        .unwrap();

    assert_eq!(wakeups.load(Ordering::SeqCst), 1);
}

#[test]
fn payload_errors_propagate() {
    let _serial = setup();

    let result = ServiceInfo::new("t-err")
        .allow_root(true)
        .config(Config::default())
        .run_fn(|mgr| {
            mgr.drop_privileges()?;
            Err(ServiceError::Payload("listener exploded".to_owned()))
        })
        .run();

    match result {
        Err(ServiceError::Payload(msg)) => assert!(msg.contains("listener exploded")),
        other => panic!("expected a payload error, got {:?}", other),
    }
}

#[test]
fn set_started_before_drop_is_fatal() {
    let _serial = setup();

    let result = ServiceInfo::new("t-early")
        .allow_root(true)
        .config(Config::default())
        .run_fn(|mgr| {
            mgr.set_started();
            Ok(())
        })
        .run();

    match result {
        Err(ServiceError::Payload(msg)) => assert!(msg.contains("panicked")),
        other => panic!("expected the panic to surface, got {:?}", other),
    }
}

#[test]
fn pid_file_exists_while_running_and_is_removed_after() {
    let _serial = setup();

    let dir = std::env::temp_dir().join(format!("service-forge-sup-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let pid_path = dir.join("t.pid");

    let mut config = Config::default();
    config.pidfile = pid_path.to_str().unwrap().to_owned();

    let seen = Arc::new(Mutex::new(String::new()));
    let seen_in_payload = Arc::clone(&seen);
    let check_path = pid_path.clone();

    ServiceInfo::new("t-pid")
        .allow_root(true)
        .config(config)
        .run_fn(move |mgr| {
            mgr.drop_privileges()?;
            mgr.set_started();
            *seen_in_payload.lock().unwrap() = std::fs::read_to_string(&check_path)?;
            Ok(())
        })
        .run()
        .unwrap();

    assert_eq!(
        seen.lock().unwrap().as_str(),
        format!("{}\n", std::process::id())
    );
    assert!(!pid_path.exists());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn chroot_without_privilege_drop_is_rejected() {
    let _serial = setup();

    let mut config = Config::default();
    config.chroot = "/var/empty".to_owned();

    let result = ServiceInfo::new("t-chroot")
        .allow_root(true)
        .config(config)
        .run_fn(|mgr| {
            mgr.drop_privileges()?;
            Ok(())
        })
        .run();

    match result {
        Err(ServiceError::Config(msg)) => assert!(msg.contains("chroot")),
        other => panic!("expected Config error, got {:?}", other),
    }
}

#[test]
fn gid_present_without_uid_is_rejected() {
    let _serial = setup();

    let mut config = Config::default();
    config.gid = "daemon".to_owned();

    let result = ServiceInfo::new("t-gid")
        .allow_root(true)
        .config(config)
        .run_fn(|mgr| {
            mgr.drop_privileges()?;
            Ok(())
        })
        .run();

    match result {
        Err(ServiceError::Config(msg)) => assert!(msg.contains("UID")),
        other => panic!("expected Config error, got {:?}", other),
    }
}

#[test]
fn root_without_drop_is_refused_unless_allowed() {
    let _serial = setup();

    let result = ServiceInfo::new("t-root")
        .config(Config::default())
        .run_fn(|mgr| {
            mgr.drop_privileges()?;
            mgr.set_started();
            Ok(())
        })
        .run();

    if unsafe { libc::getuid() } == 0 {
        match result {
            Err(ServiceError::PrivilegeVerify(_)) => {}
            other => panic!("expected PrivilegeVerify as root, got {:?}", other),
        }
    } else {
        // A plain unprivileged run passes the same check.
        result.unwrap();
    }
}

struct Ticker {
    status_tx: Sender<String>,
    status_rx: Option<Receiver<String>>,
    started: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl Ticker {
    fn new(started: Arc<AtomicBool>, stopped: Arc<AtomicBool>) -> Ticker {
        let (status_tx, status_rx) = mpsc::channel();
        Ticker {
            status_tx,
            status_rx: Some(status_rx),
            started,
            stopped,
        }
    }
}

impl Runnable for Ticker {
    fn start(&mut self) -> ServiceResult<()> {
        self.started.store(true, Ordering::SeqCst);
        let _ = self.status_tx.send("warmed up".to_owned());
        Ok(())
    }

    fn stop(&mut self) -> ServiceResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl StatusSource for Ticker {
    fn status_chan(&mut self) -> Receiver<String> {
        self.status_rx.take().expect("status channel taken twice")
    }
}

#[test]
fn runnable_is_started_and_stopped_by_the_supervisor() {
    let _serial = setup();

    let started = Arc::new(AtomicBool::new(false));
    let stopped = Arc::new(AtomicBool::new(false));
    let runnable_started = Arc::clone(&started);
    let runnable_stopped = Arc::clone(&stopped);

    raise_sigterm_after(Duration::from_millis(200));

    ServiceInfo::new("t-runnable")
        .allow_root(true)
        .config(Config::default())
        .runnable_with_status(move || Ok(Ticker::new(runnable_started, runnable_stopped)))
        .run()
        .unwrap();

    assert!(started.load(Ordering::SeqCst));
    assert!(stopped.load(Ordering::SeqCst));
}
