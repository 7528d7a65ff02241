//! The minimal skeleton structure of a ServiceForge daemon. Runs as a
//! service on Windows or a daemon on UNIX; the systemd notify protocol is
//! supported.

use service_forge::{Config, ServiceInfo};

fn main() {
    ServiceInfo::new("foobar")
        .title("Foobar Web Server")
        .description("Foobar Web Server is the greatest webserver ever.")
        .config(Config::default())
        .run_fn(|mgr| {
            // Start up your service.
            // ...

            // Once initialization requiring root is done, call this.
            mgr.drop_privileges()?;

            // When it is ready to serve requests, call this. Privileges
            // must have been dropped first.
            mgr.set_started();

            // Optionally set a status.
            mgr.set_status("foobar: running ok");

            // Serve requests here, or do so on other threads controlled
            // from here, until the stop signal fires.
            mgr.stop_signal().wait();

            // Do any necessary teardown.
            // ...

            Ok(())
        })
        .main_exit();
}
