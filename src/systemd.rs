//! The systemd notify protocol.
//!
//! Status updates are plain `KEY=VALUE` lines sent as datagrams to the
//! socket named by `NOTIFY_SOCKET`. The socket is dialed lazily and then
//! kept open for the rest of the process's life: a service that has
//! chrooted itself could never re-resolve the socket path, but an already
//! connected datagram socket keeps working.

use std::env;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;

enum NotifyState {
    // Not dialed yet.
    Unknown,
    // NOTIFY_SOCKET was unset or unusable; notification stays off silently.
    Unavailable,
    Connected(UnixDatagram),
}

static SOCKET: Mutex<NotifyState> = Mutex::new(NotifyState::Unknown);

/// Sends a notification state such as `READY=1\nSTATUS=serving\n` to the
/// init daemon. It is common to ignore the error.
pub fn notify(state: &str) -> io::Result<()> {
    let mut guard = SOCKET.lock().unwrap();

    if let NotifyState::Unknown = *guard {
        *guard = match dial() {
            Some(sock) => NotifyState::Connected(sock),
            None => NotifyState::Unavailable,
        };
    }

    match &*guard {
        NotifyState::Connected(sock) => sock.send(state.as_bytes()).map(|_| ()),
        _ => Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no systemd notify socket",
        )),
    }
}

/// Probes for a usable notify socket by sending an empty line. Returns
/// true iff the send succeeded, i.e. we are running under systemd with
/// `Type=notify`.
pub fn probe() -> bool {
    notify("\n").is_ok()
}

fn dial() -> Option<UnixDatagram> {
    let path = env::var_os("NOTIFY_SOCKET")?;
    if path.is_empty() {
        return None;
    }
    let sock = UnixDatagram::unbound().ok()?;
    sock.connect(&path).ok()?;
    Some(sock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    // NOTIFY_SOCKET is read once and the connection is then pinned, so a
    // single test exercises the whole lifecycle end to end.
    #[test]
    fn notifies_over_a_real_datagram_socket() {
        let dir = env::temp_dir().join(format!("service-forge-sd-{}", process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sock_path = dir.join("notify.sock");
        let server = UnixDatagram::bind(&sock_path).unwrap();

        unsafe {
            env::set_var("NOTIFY_SOCKET", &sock_path);
        }

        assert!(probe());
        notify("READY=1\nSTATUS=serving requests\n").unwrap();

        let mut buf = [0u8; 256];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\n");
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1\nSTATUS=serving requests\n");

        // The connection survives the socket path becoming unreachable,
        // which is what a chrooted service relies on.
        std::fs::remove_file(&sock_path).unwrap();
        notify("STATUS=still here\n").unwrap();
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS=still here\n");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
