//! A periodic ticker expressed as a `Runnable` with status reporting. Try
//! it interactively, under systemd with `Type=notify`, or with `--fork` to
//! detach into the background.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use service_forge::{Config, Runnable, ServiceInfo, ServiceResult, StatusSource};

struct Ticker {
    status_tx: Sender<String>,
    status_rx: Option<Receiver<String>>,
    stop_flag: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    fn new() -> Ticker {
        let (status_tx, status_rx) = mpsc::channel();
        Ticker {
            status_tx,
            status_rx: Some(status_rx),
            stop_flag: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Runnable for Ticker {
    fn start(&mut self) -> ServiceResult<()> {
        let status_tx = self.status_tx.clone();
        let stop_flag = Arc::clone(&self.stop_flag);

        self.worker = Some(thread::spawn(move || {
            let mut n: u64 = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                n += 1;
                let _ = status_tx.send(format!("tick #{}", n));
                thread::sleep(Duration::from_secs(1));
            }
        }));
        Ok(())
    }

    fn stop(&mut self) -> ServiceResult<()> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }
}

impl StatusSource for Ticker {
    fn status_chan(&mut self) -> Receiver<String> {
        self.status_rx.take().expect("status channel requested twice")
    }
}

fn main() {
    // Arguments come from the library so the internal fork marker is never
    // visible here.
    let mut config = Config::default();
    for arg in service_forge::args().iter().skip(1) {
        match arg.to_str() {
            Some("--daemon") => config.daemon = true,
            Some("--fork") => config.fork = true,
            Some("--stderr") => config.stderr = true,
            Some(other) if other.starts_with("--pidfile=") => {
                config.pidfile = other["--pidfile=".len()..].to_owned();
            }
            Some(other) if other.starts_with("--uid=") => {
                config.uid = other["--uid=".len()..].to_owned();
            }
            Some(other) if other.starts_with("--gid=") => {
                config.gid = other["--gid=".len()..].to_owned();
            }
            _ => {}
        }
    }

    ServiceInfo::new("ticker")
        .title("Periodic Ticker")
        .description("Emits a status line every second until stopped.")
        .allow_root(true)
        .config(config)
        .runnable_with_status(|| Ok(Ticker::new()))
        .main_exit();
}
