// ABOUTME: Background mode for the sync scheduler: PID file, log file, detach, stop
// ABOUTME: Unix detaches with the daemonize crate; Windows respawns a windowless child process

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "database-bisync";
const PID_FILE: &str = "bisync.pid";
const LOG_FILE: &str = "bisync.log";
/// Marker argument passed to the respawned child on Windows.
#[cfg(windows)]
const CHILD_FLAG: &str = "--daemon-child";

/// PID and log locations of the background scheduler.
#[derive(Debug, Clone)]
pub struct DaemonPaths {
    dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<i32>,
    pub pid_file_exists: bool,
}

impl DaemonPaths {
    /// `~/.database-bisync/` on Unix, `%LOCALAPPDATA%\database-bisync\` on Windows.
    pub fn default_location() -> Result<Self> {
        #[cfg(windows)]
        let dir = dirs::data_local_dir()
            .context("Failed to determine AppData directory")?
            .join(APP_DIR);

        #[cfg(not(windows))]
        let dir = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(format!(".{APP_DIR}"));

        Self::in_dir(dir)
    }

    pub fn in_dir(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create daemon directory: {:?}", dir))?;
        Ok(Self { dir })
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join(PID_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    pub fn read_pid(&self) -> Result<Option<i32>> {
        let pid_file = self.pid_file();
        if !pid_file.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&pid_file)
            .with_context(|| format!("Failed to read PID file: {:?}", pid_file))?;
        let pid = content
            .trim()
            .parse()
            .with_context(|| format!("Invalid PID in file: {}", content.trim()))?;
        Ok(Some(pid))
    }

    pub fn write_pid(&self) -> Result<()> {
        let pid_file = self.pid_file();
        fs::write(&pid_file, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file: {:?}", pid_file))
    }

    pub fn remove_pid_file(&self) -> Result<()> {
        let pid_file = self.pid_file();
        if pid_file.exists() {
            fs::remove_file(&pid_file)
                .with_context(|| format!("Failed to remove PID file: {:?}", pid_file))?;
        }
        Ok(())
    }

    pub fn status(&self) -> Result<DaemonStatus> {
        let pid = self.read_pid()?;
        Ok(DaemonStatus {
            running: pid.is_some_and(is_process_running),
            pid,
            pid_file_exists: self.pid_file().exists(),
        })
    }

    /// Refuse to start a second instance; clear a stale PID file.
    fn claim(&self) -> Result<()> {
        let status = self.status()?;
        if let (true, Some(pid)) = (status.running, status.pid) {
            bail!("Scheduler is already running in the background (PID: {pid}). Use --stop first.");
        }
        if status.pid_file_exists {
            self.remove_pid_file()?;
        }
        Ok(())
    }

    /// Stop the background scheduler. Returns false when none was running.
    pub fn stop(&self) -> Result<bool> {
        let status = self.status()?;
        let Some(pid) = status.pid.filter(|_| status.running) else {
            if status.pid_file_exists {
                self.remove_pid_file()?;
                println!("Removed stale PID file (process was not running)");
            }
            return Ok(false);
        };
        terminate(pid)?;
        self.remove_pid_file()?;
        Ok(true)
    }

    /// Detach from the terminal. On Unix the current process continues as the daemon;
    /// on Windows a detached child is spawned and the caller should exit.
    pub fn detach(&self) -> Result<Detached> {
        self.claim()?;
        println!("Starting background scheduler...");
        println!("PID file: {:?}", self.pid_file());
        println!("Log file: {:?}", self.log_file());
        detach_process(self)
    }

    pub fn print_status(&self) -> Result<()> {
        let status = self.status()?;
        match (status.running, status.pid) {
            (true, Some(pid)) => {
                println!("Background scheduler: RUNNING");
                println!("PID: {}", pid);
                println!("Log file: {:?}", self.log_file());
                let tail = tail_lines(&self.log_file(), 10)?;
                if !tail.is_empty() {
                    println!("\nRecent log entries:");
                    println!("-------------------");
                    for line in tail {
                        println!("{}", line);
                    }
                }
            }
            _ => {
                println!("Background scheduler: NOT RUNNING");
                if let Some(pid) = status.pid.filter(|_| status.pid_file_exists) {
                    println!("Note: Stale PID file exists (PID {} is not running)", pid);
                    println!("Run with --stop to clean up the stale PID file");
                }
            }
        }
        Ok(())
    }
}

/// Where execution continues after [`DaemonPaths::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// This process is now the daemon.
    InDaemon,
    /// A child process took over; this one should exit.
    Spawned(u32),
}

fn tail_lines(path: &Path, count: usize) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read log file: {:?}", path))?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(count);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}

#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    // Signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(unix)]
fn terminate(pid: i32) -> Result<()> {
    println!("Sending SIGTERM to background scheduler (PID: {})", pid);
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        bail!(
            "Failed to send SIGTERM to process {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }

    // Jobs finish their current phase before the process exits.
    let start = std::time::Instant::now();
    let timeout = std::time::Duration::from_secs(30);
    while is_process_running(pid) {
        if start.elapsed() > timeout {
            println!("Process didn't exit within 30 seconds, sending SIGKILL");
            unsafe { libc::kill(pid, libc::SIGKILL) };
            std::thread::sleep(std::time::Duration::from_millis(500));
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
    Ok(())
}

#[cfg(unix)]
fn detach_process(paths: &DaemonPaths) -> Result<Detached> {
    use daemonize::Daemonize;
    use std::fs::OpenOptions;

    let log_file = paths.log_file();
    let open_log = || {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .with_context(|| format!("Failed to open log file: {:?}", log_file))
    };

    Daemonize::new()
        .pid_file(paths.pid_file())
        .chown_pid_file(true)
        .working_directory(".")
        .stdout(open_log()?)
        .stderr(open_log()?)
        .start()
        .context("Failed to daemonize process")?;

    Ok(Detached::InDaemon)
}

#[cfg(windows)]
extern "system" {
    fn OpenProcess(
        dwDesiredAccess: u32,
        bInheritHandle: i32,
        dwProcessId: u32,
    ) -> *mut std::ffi::c_void;
    fn GetExitCodeProcess(hProcess: *mut std::ffi::c_void, lpExitCode: *mut u32) -> i32;
    fn CloseHandle(hObject: *mut std::ffi::c_void) -> i32;
    fn TerminateProcess(hProcess: *mut std::ffi::c_void, uExitCode: u32) -> i32;
}

#[cfg(windows)]
fn is_process_running(pid: i32) -> bool {
    const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;
    const SYNCHRONIZE: u32 = 0x0010_0000;
    const STILL_ACTIVE: u32 = 259;

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION | SYNCHRONIZE, 0, pid as u32);
        if handle.is_null() {
            return false;
        }
        let mut exit_code: u32 = 0;
        let result = GetExitCodeProcess(handle, &mut exit_code);
        CloseHandle(handle);
        result != 0 && exit_code == STILL_ACTIVE
    }
}

#[cfg(windows)]
fn terminate(pid: i32) -> Result<()> {
    const PROCESS_TERMINATE: u32 = 0x0001;
    println!("Terminating background scheduler (PID: {})", pid);
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid as u32);
        if handle.is_null() {
            bail!(
                "Failed to open process {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
        let result = TerminateProcess(handle, 0);
        CloseHandle(handle);
        if result == 0 {
            bail!(
                "Failed to terminate process {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
    std::thread::sleep(std::time::Duration::from_millis(500));
    Ok(())
}

#[cfg(windows)]
fn detach_process(_paths: &DaemonPaths) -> Result<Detached> {
    use std::os::windows::process::CommandExt;
    use std::process::Command;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let exe = std::env::current_exe().context("Failed to get current executable path")?;
    let mut args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--background" && arg != "--minimized")
        .collect();
    args.push(CHILD_FLAG.to_string());

    let child = Command::new(exe)
        .args(&args)
        .creation_flags(CREATE_NO_WINDOW)
        .spawn()
        .context("Failed to spawn background process")?;
    // The child writes its own PID file on startup.
    Ok(Detached::Spawned(child.id()))
}
