//! Windows entry point: a thin state machine bridging the Service Control
//! Manager to the manager interface, plus the one-shot install/remove/
//! start/stop subcommands and an interactive fallback with Ctrl+C
//! handling.

use std::ffi::{c_void, OsStr};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crate::error::{ServiceError, ServiceResult};
use crate::manager::{Event, Ihandler, Manager, StopSignal};
use crate::service::{run_interactively, Payload, ServiceInfo};

pub(crate) const PLATFORM_NAME: &str = "windows";

/// Windows cannot chroot; present for cross-platform code only.
pub const EMPTY_CHROOT_PATH: &str = "";

// =========================================================================
// Raw service control manager API
// =========================================================================

#[allow(non_snake_case, non_camel_case_types)]
mod scm_api {
    use std::ffi::c_void;

    pub type Handle = *mut c_void;

    #[repr(C)]
    pub struct SERVICE_STATUS {
        pub dwServiceType: u32,
        pub dwCurrentState: u32,
        pub dwControlsAccepted: u32,
        pub dwWin32ExitCode: u32,
        pub dwServiceSpecificExitCode: u32,
        pub dwCheckPoint: u32,
        pub dwWaitHint: u32,
    }

    #[repr(C)]
    pub struct SERVICE_TABLE_ENTRYW {
        pub lpServiceName: *const u16,
        pub lpServiceProc: Option<unsafe extern "system" fn(u32, *mut *mut u16)>,
    }

    #[repr(C)]
    pub struct SERVICE_DESCRIPTIONW {
        pub lpDescription: *const u16,
    }

    pub type HandlerEx =
        unsafe extern "system" fn(u32, u32, *mut c_void, *mut c_void) -> u32;

    pub const SERVICE_WIN32_OWN_PROCESS: u32 = 0x0000_0010;

    pub const SERVICE_STOPPED: u32 = 1;
    pub const SERVICE_START_PENDING: u32 = 2;
    pub const SERVICE_STOP_PENDING: u32 = 3;
    pub const SERVICE_RUNNING: u32 = 4;

    pub const SERVICE_ACCEPT_STOP: u32 = 0x0000_0001;
    pub const SERVICE_ACCEPT_SHUTDOWN: u32 = 0x0000_0004;

    pub const SERVICE_CONTROL_STOP: u32 = 1;
    pub const SERVICE_CONTROL_INTERROGATE: u32 = 4;
    pub const SERVICE_CONTROL_SHUTDOWN: u32 = 5;

    pub const SC_MANAGER_ALL_ACCESS: u32 = 0x000F_003F;
    pub const SERVICE_ALL_ACCESS: u32 = 0x000F_01FF;
    pub const SERVICE_AUTO_START: u32 = 2;
    pub const SERVICE_ERROR_NORMAL: u32 = 1;
    pub const SERVICE_CONFIG_DESCRIPTION: u32 = 1;

    pub const NO_ERROR: u32 = 0;
    pub const ERROR_CALL_NOT_IMPLEMENTED: u32 = 120;
    pub const ERROR_FAILED_SERVICE_CONTROLLER_CONNECT: u32 = 1063;

    #[link(name = "advapi32")]
    unsafe extern "system" {
        pub fn StartServiceCtrlDispatcherW(lpServiceStartTable: *const SERVICE_TABLE_ENTRYW)
            -> i32;
        pub fn RegisterServiceCtrlHandlerExW(
            lpServiceName: *const u16,
            lpHandlerProc: HandlerEx,
            lpContext: *mut c_void,
        ) -> Handle;
        pub fn SetServiceStatus(hServiceStatus: Handle, lpServiceStatus: *const SERVICE_STATUS)
            -> i32;
        pub fn OpenSCManagerW(
            lpMachineName: *const u16,
            lpDatabaseName: *const u16,
            dwDesiredAccess: u32,
        ) -> Handle;
        pub fn CreateServiceW(
            hSCManager: Handle,
            lpServiceName: *const u16,
            lpDisplayName: *const u16,
            dwDesiredAccess: u32,
            dwServiceType: u32,
            dwStartType: u32,
            dwErrorControl: u32,
            lpBinaryPathName: *const u16,
            lpLoadOrderGroup: *const u16,
            lpdwTagId: *mut u32,
            lpDependencies: *const u16,
            lpServiceStartName: *const u16,
            lpPassword: *const u16,
        ) -> Handle;
        pub fn OpenServiceW(hSCManager: Handle, lpServiceName: *const u16, dwDesiredAccess: u32)
            -> Handle;
        pub fn ChangeServiceConfig2W(hService: Handle, dwInfoLevel: u32, lpInfo: *mut c_void)
            -> i32;
        pub fn DeleteService(hService: Handle) -> i32;
        pub fn StartServiceW(
            hService: Handle,
            dwNumServiceArgs: u32,
            lpServiceArgVectors: *const *const u16,
        ) -> i32;
        pub fn ControlService(
            hService: Handle,
            dwControl: u32,
            lpServiceStatus: *mut SERVICE_STATUS,
        ) -> i32;
        pub fn QueryServiceStatus(hService: Handle, lpServiceStatus: *mut SERVICE_STATUS) -> i32;
        pub fn CloseServiceHandle(hSCObject: Handle) -> i32;
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        pub fn SetConsoleCtrlHandler(
            handler: Option<unsafe extern "system" fn(u32) -> i32>,
            add: i32,
        ) -> i32;
    }
}

use scm_api::*;

struct ScopedHandle(Handle);

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        unsafe {
            if !self.0.is_null() {
                CloseServiceHandle(self.0);
            }
        }
    }
}

fn wide(s: &str) -> Vec<u16> {
    let mut w: Vec<u16> = OsStr::new(s).encode_wide().collect();
    w.push(0);
    w
}

fn last_error(call: &'static str) -> ServiceError {
    ServiceError::Windows {
        call,
        code: io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32,
    }
}

// =========================================================================
// Entry point
// =========================================================================

pub(crate) fn service_main(info: ServiceInfo) -> ServiceResult<()> {
    match info.config.command.as_str() {
        "install" => return install_service(&info),
        "remove" => return remove_service(&info),
        "start" => return start_service(&info),
        "stop" => return stop_service(&info),
        "" => {}
        other => {
            return Err(ServiceError::Config(format!(
                "unknown service command: {}",
                other
            )));
        }
    }

    run_as_service(info)
}

/// Privilege dropping does not exist on Windows; only the ordering
/// contract with `set_started` is kept.
pub(crate) fn drop_privileges(h: &Ihandler) -> ServiceResult<()> {
    h.dropped.store(true, Ordering::SeqCst);
    Ok(())
}

// =========================================================================
// Interactive mode (console Ctrl+C as the stop request)
// =========================================================================

static CONSOLE_HANDLER: OnceLock<Arc<Ihandler>> = OnceLock::new();

unsafe extern "system" fn console_ctrl(_ctrl_type: u32) -> i32 {
    match CONSOLE_HANDLER.get() {
        Some(handler) => {
            handler.send(Event::Stop);
            1
        }
        None => 0,
    }
}

pub(crate) fn subscribe_stop_events(handler: &Arc<Ihandler>) -> ServiceResult<()> {
    let _ = CONSOLE_HANDLER.set(Arc::clone(handler));
    if unsafe { SetConsoleCtrlHandler(Some(console_ctrl), 1) } == 0 {
        return Err(last_error("SetConsoleCtrlHandler"));
    }
    Ok(())
}

// =========================================================================
// Service mode
// =========================================================================

// The dispatcher calls back into a plain function, so the service being
// run and its outcome travel through these.
static DISPATCHED_INFO: Mutex<Option<ServiceInfo>> = Mutex::new(None);
static DISPATCHED_RESULT: Mutex<Option<ServiceResult<()>>> = Mutex::new(None);
static SERVICE_NAME_W: OnceLock<Vec<u16>> = OnceLock::new();

/// Per-run state shared with the control handler callback.
struct ScmState {
    events: Mutex<Sender<Event>>,
    status_handle: AtomicUsize,
    // Mirror of the last reported state, echoed on interrogation.
    current_state: AtomicUsize,
    accepts: AtomicUsize,
}

impl ScmState {
    fn send(&self, event: Event) {
        let _ = self.events.lock().unwrap().send(event);
    }

    fn report(&self, state: u32, accepts: u32, exit_code: u32) {
        self.current_state.store(state as usize, Ordering::SeqCst);
        self.accepts.store(accepts as usize, Ordering::SeqCst);

        let status = SERVICE_STATUS {
            dwServiceType: SERVICE_WIN32_OWN_PROCESS,
            dwCurrentState: state,
            dwControlsAccepted: accepts,
            dwWin32ExitCode: exit_code,
            dwServiceSpecificExitCode: 0,
            dwCheckPoint: 0,
            dwWaitHint: 0,
        };
        let handle = self.status_handle.load(Ordering::SeqCst) as Handle;
        if !handle.is_null() {
            unsafe {
                SetServiceStatus(handle, &status);
            }
        }
    }
}

/// The manager handed to payloads when running under the SCM.
struct ScmHandler {
    stop: StopSignal,
    events: Mutex<Sender<Event>>,
    status: Mutex<String>,
    dropped: AtomicBool,
}

impl Manager for ScmHandler {
    fn drop_privileges(&self) -> ServiceResult<()> {
        self.dropped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_started(&self) {
        if !self.dropped.load(Ordering::SeqCst) {
            panic!("service must call drop_privileges before calling set_started");
        }
        let _ = self.events.lock().unwrap().send(Event::Started);
    }

    fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    fn set_status(&self, status: &str) {
        *self.status.lock().unwrap() = status.to_owned();
    }

    // There is no chroot on Windows; paths are never displaced.
    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        Some(path.to_path_buf())
    }
}

unsafe extern "system" fn control_handler(
    control: u32,
    _event_type: u32,
    _event_data: *mut c_void,
    context: *mut c_void,
) -> u32 {
    let state = unsafe { &*(context as *const ScmState) };
    match control {
        SERVICE_CONTROL_INTERROGATE => {
            state.report(
                state.current_state.load(Ordering::SeqCst) as u32,
                state.accepts.load(Ordering::SeqCst) as u32,
                NO_ERROR,
            );
            NO_ERROR
        }
        SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
            // Stop is pending; accept no further controls while it is.
            state.report(SERVICE_STOP_PENDING, 0, NO_ERROR);
            state.send(Event::Stop);
            NO_ERROR
        }
        _ => ERROR_CALL_NOT_IMPLEMENTED,
    }
}

unsafe extern "system" fn ffi_service_main(_argc: u32, _argv: *mut *mut u16) {
    let info = match DISPATCHED_INFO.lock().unwrap().take() {
        Some(info) => info,
        None => return,
    };
    let result = run_service_body(info);
    *DISPATCHED_RESULT.lock().unwrap() = Some(result);
}

fn run_service_body(mut info: ServiceInfo) -> ServiceResult<()> {
    let (tx, rx) = mpsc::channel();

    let state = Arc::new(ScmState {
        events: Mutex::new(tx.clone()),
        status_handle: AtomicUsize::new(0),
        current_state: AtomicUsize::new(SERVICE_START_PENDING as usize),
        accepts: AtomicUsize::new(0),
    });

    let name_w = SERVICE_NAME_W.get_or_init(|| wide(&info.name));
    let context = Arc::into_raw(Arc::clone(&state)) as *mut c_void;
    let handle =
        unsafe { RegisterServiceCtrlHandlerExW(name_w.as_ptr(), control_handler, context) };
    if handle.is_null() {
        unsafe {
            drop(Arc::from_raw(context as *const ScmState));
        }
        return Err(last_error("RegisterServiceCtrlHandlerExW"));
    }
    state.status_handle.store(handle as usize, Ordering::SeqCst);

    state.report(SERVICE_START_PENDING, 0, NO_ERROR);

    let handler = Arc::new(ScmHandler {
        stop: StopSignal::new(),
        events: Mutex::new(tx),
        status: Mutex::new(String::new()),
        dropped: AtomicBool::new(false),
    });

    let run_fn = match info.payload.take() {
        Some(Payload::Run(f)) => f,
        Some(Payload::New(n)) => crate::service::synthesize_run(info.name.clone(), n),
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
            let _ = payload_handler.events.lock().unwrap().send(Event::Done(result));
        })?;

    const CMDS_ACCEPTED: u32 = SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN;
    let mut started = false;
    let mut stopping = false;

    let payload_result = loop {
        let event = match rx.recv() {
            Ok(event) => event,
            Err(_) => break Ok(()),
        };
        match event {
            Event::Stop => {
                if !stopping {
                    stopping = true;
                    handler.stop.fire();
                }
            }
            Event::Started => {
                // Idempotent, like the interactive loop: a repeated
                // set_started must not take down the service host, which
                // this loop is called into by the SCM dispatcher.
                if !started {
                    started = true;
                    state.report(SERVICE_RUNNING, CMDS_ACCEPTED, NO_ERROR);
                }
            }
            Event::StatusChange => {}
            Event::Done(result) => break result,
        }
    };

    // A payload failure becomes SCM exit code 1; the process itself still
    // leaves cleanly, the way service hosts are expected to.
    match payload_result {
        Ok(()) => {
            state.report(SERVICE_STOPPED, 0, NO_ERROR);
            Ok(())
        }
        Err(err) => {
            let last_status = handler.status.lock().unwrap().clone();
            if last_status.is_empty() {
                log::error!("service payload failed: {}", err);
            } else {
                log::error!("service payload failed ({}): {}", last_status, err);
            }
            state.report(SERVICE_STOPPED, 0, 1);
            Ok(())
        }
    }
}

fn run_as_service(info: ServiceInfo) -> ServiceResult<()> {
    let name_w = wide(&info.name);
    *DISPATCHED_INFO.lock().unwrap() = Some(info);

    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: name_w.as_ptr(),
            lpServiceProc: Some(ffi_service_main),
        },
        SERVICE_TABLE_ENTRYW {
            lpServiceName: ptr::null(),
            lpServiceProc: None,
        },
    ];

    if unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) } == 0 {
        let code = io::Error::last_os_error().raw_os_error().unwrap_or(0) as u32;
        if code == ERROR_FAILED_SERVICE_CONTROLLER_CONNECT {
            // Not under the service manager: run interactively instead.
            let info = DISPATCHED_INFO
                .lock()
                .unwrap()
                .take()
                .expect("service info present when the dispatcher never ran");
            return run_interactively(info, false);
        }
        return Err(ServiceError::Windows {
            call: "StartServiceCtrlDispatcherW",
            code,
        });
    }

    DISPATCHED_RESULT
        .lock()
        .unwrap()
        .take()
        .unwrap_or(Ok(()))
}

// =========================================================================
// One-shot service control subcommands
// =========================================================================

fn open_scm() -> ServiceResult<ScopedHandle> {
    let scm = unsafe { OpenSCManagerW(ptr::null(), ptr::null(), SC_MANAGER_ALL_ACCESS) };
    if scm.is_null() {
        return Err(last_error("OpenSCManagerW"));
    }
    Ok(ScopedHandle(scm))
}

fn open_service(scm: &ScopedHandle, name: &str) -> ServiceResult<ScopedHandle> {
    let name_w = wide(name);
    let service = unsafe { OpenServiceW(scm.0, name_w.as_ptr(), SERVICE_ALL_ACCESS) };
    if service.is_null() {
        return Err(last_error("OpenServiceW"));
    }
    Ok(ScopedHandle(service))
}

fn install_service(info: &ServiceInfo) -> ServiceResult<()> {
    let scm = open_scm()?;

    if open_service(&scm, &info.name).is_ok() {
        return Err(ServiceError::Config(format!(
            "service {} already exists",
            info.name
        )));
    }

    let exe = std::env::current_exe()?;
    let name_w = wide(&info.name);
    let title_w = wide(&info.title);
    let exe_w = wide(&exe.to_string_lossy());

    let service = unsafe {
        CreateServiceW(
            scm.0,
            name_w.as_ptr(),
            title_w.as_ptr(),
            SERVICE_ALL_ACCESS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_AUTO_START,
            SERVICE_ERROR_NORMAL,
            exe_w.as_ptr(),
            ptr::null(),
            ptr::null_mut(),
            ptr::null(),
            ptr::null(),
            ptr::null(),
        )
    };
    if service.is_null() {
        return Err(last_error("CreateServiceW"));
    }
    let service = ScopedHandle(service);

    // The description is cosmetic; failure to set it is not worth failing
    // the installation over.
    let description_w = wide(&info.description);
    let mut description = SERVICE_DESCRIPTIONW {
        lpDescription: description_w.as_ptr(),
    };
    unsafe {
        ChangeServiceConfig2W(
            service.0,
            SERVICE_CONFIG_DESCRIPTION,
            &mut description as *mut _ as *mut c_void,
        );
    }

    Ok(())
}

fn remove_service(info: &ServiceInfo) -> ServiceResult<()> {
    let scm = open_scm()?;
    let service = open_service(&scm, &info.name)
        .map_err(|_| ServiceError::Config(format!("service {} is not installed", info.name)))?;

    if unsafe { DeleteService(service.0) } == 0 {
        return Err(last_error("DeleteService"));
    }
    Ok(())
}

fn start_service(info: &ServiceInfo) -> ServiceResult<()> {
    let scm = open_scm()?;
    let service = open_service(&scm, &info.name)?;

    if unsafe { StartServiceW(service.0, 0, ptr::null()) } == 0 {
        return Err(last_error("StartServiceW"));
    }
    Ok(())
}

fn stop_service(info: &ServiceInfo) -> ServiceResult<()> {
    let scm = open_scm()?;
    let service = open_service(&scm, &info.name)?;

    let mut status = SERVICE_STATUS {
        dwServiceType: 0,
        dwCurrentState: 0,
        dwControlsAccepted: 0,
        dwWin32ExitCode: 0,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: 0,
        dwWaitHint: 0,
    };
    if unsafe { ControlService(service.0, SERVICE_CONTROL_STOP, &mut status) } == 0 {
        return Err(last_error("ControlService"));
    }

    while status.dwCurrentState != SERVICE_STOPPED {
        thread::sleep(Duration::from_millis(300));
        if unsafe { QueryServiceStatus(service.0, &mut status) } == 0 {
            return Err(last_error("QueryServiceStatus"));
        }
    }
    Ok(())
}
