//! OS process capability used by supervisors.
//!
//! The supervisor only sees the [`GuestProcess`] trait; [`OsProcessLauncher`]
//! is the real implementation, tests plug in scripted ones.

use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use guestctl_protocol::{ExecFlags, GuestProcessSpec, OutputHandle};
use nix::unistd::User;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl From<OutputHandle> for OutputStream {
    fn from(handle: OutputHandle) -> Self {
        if handle.is_stderr() {
            OutputStream::Stderr
        } else {
            OutputStream::Stdout
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    Signaled(i32),
    Abnormal,
}

impl From<ExitStatus> for ExitState {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitState::Exited(code),
            (None, Some(signal)) => ExitState::Signaled(signal),
            (None, None) => ExitState::Abnormal,
        }
    }
}

/// A running guest process and its stdio pipes.
pub trait GuestProcess: Send {
    fn os_pid(&self) -> u32;

    /// Write without blocking. Returns how many bytes the pipe took, which
    /// may be zero. A closed stdin is `ErrorKind::BrokenPipe`.
    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize>;

    fn close_stdin(&mut self);

    /// Read whatever is available within `timeout`. Zero bytes is not an error.
    fn read_output(&mut self, stream: OutputStream, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// True once `stream` hit end-of-file, or if it is not captured at all.
    fn at_eof(&self, stream: OutputStream) -> bool;

    /// True while a captured stream may still produce data.
    fn has_pending_output(&self) -> bool {
        !(self.at_eof(OutputStream::Stdout) && self.at_eof(OutputStream::Stderr))
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>>;

    /// Kill and reap.
    fn kill(&mut self) -> io::Result<ExitState>;

    /// Let go of a process that is left running. It is still reaped once
    /// it exits.
    fn detach(self: Box<Self>) {}
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &GuestProcessSpec) -> io::Result<Box<dyn GuestProcess>>;
}

/// Spawns real processes with `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessLauncher;

impl OsProcessLauncher {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessLauncher for OsProcessLauncher {
    fn launch(&self, spec: &GuestProcessSpec) -> io::Result<Box<dyn GuestProcess>> {
        let mut cmd = Command::new(&spec.command);
        if let Some((argv0, rest)) = spec.args.split_first() {
            cmd.arg0(argv0).args(rest);
        }
        for entry in &spec.env {
            match entry.split_once('=') {
                Some((key, value)) => {
                    cmd.env(key, value);
                }
                None => {
                    cmd.env_remove(entry);
                }
            }
        }
        if !spec.user.is_empty() {
            let (uid, gid) = lookup_user(&spec.user)?;
            cmd.uid(uid).gid(gid);
        }

        cmd.stdin(Stdio::piped())
            .stdout(capture(spec.flags, ExecFlags::WAIT_STDOUT))
            .stderr(capture(spec.flags, ExecFlags::WAIT_STDERR));

        let mut child = cmd.spawn()?;
        if let Some(stdin) = &child.stdin {
            if let Err(e) = set_nonblocking(stdin.as_raw_fd()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
        debug!(command = %spec.command, os_pid = child.id(), "process spawned");

        Ok(Box::new(OsProcess {
            stdout_eof: child.stdout.is_none(),
            stderr_eof: child.stderr.is_none(),
            child,
        }))
    }
}

fn capture(flags: ExecFlags, wait: ExecFlags) -> Stdio {
    if flags.contains(wait) {
        Stdio::piped()
    } else {
        Stdio::null()
    }
}

struct OsProcess {
    child: Child,
    stdout_eof: bool,
    stderr_eof: bool,
}

impl GuestProcess for OsProcess {
    fn os_pid(&self) -> u32 {
        self.child.id()
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let Some(stdin) = self.child.stdin.as_mut() else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };
        match stdin.write(data) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn close_stdin(&mut self) {
        self.child.stdin.take();
    }

    fn read_output(&mut self, stream: OutputStream, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        let (fd, eof) = match stream {
            OutputStream::Stdout => (self.child.stdout.as_ref().map(|s| s.as_raw_fd()), &mut self.stdout_eof),
            OutputStream::Stderr => (self.child.stderr.as_ref().map(|s| s.as_raw_fd()), &mut self.stderr_eof),
        };
        let Some(fd) = fd else {
            return Ok(0);
        };
        if *eof || buf.is_empty() || !poll_readable(fd, timeout)? {
            return Ok(0);
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        if n == 0 {
            *eof = true;
        }
        Ok(n as usize)
    }

    fn at_eof(&self, stream: OutputStream) -> bool {
        match stream {
            OutputStream::Stdout => self.stdout_eof,
            OutputStream::Stderr => self.stderr_eof,
        }
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
        Ok(self.child.try_wait()?.map(ExitState::from))
    }

    fn kill(&mut self) -> io::Result<ExitState> {
        if let Err(e) = self.child.kill() {
            // Already reaped; wait() below returns the cached status.
            if e.kind() != io::ErrorKind::InvalidInput {
                return Err(e);
            }
        }
        self.child.wait().map(ExitState::from)
    }

    fn detach(self: Box<Self>) {
        let OsProcess { mut child, .. } = *self;
        let os_pid = child.id();
        child.stdout.take();
        child.stderr.take();
        let reaper = std::thread::Builder::new()
            .name(format!("guestctl-orphan-{os_pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(os_pid, %status, "orphaned process exited"),
                Err(e) => warn!(os_pid, error = %e, "failed to reap orphaned process"),
            });
        if let Err(e) = reaper {
            warn!(os_pid, error = %e, "failed to start orphan reaper");
        }
    }
}

fn poll_readable(fd: i32, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pfd, 1, millis) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0)
}

fn set_nonblocking(fd: i32) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Resolve a user name to (uid, gid) via the guest's account database.
fn lookup_user(name: &str) -> io::Result<(u32, u32)> {
    match User::from_name(name)? {
        Some(user) => Ok((user.uid.as_raw(), user.gid.as_raw())),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown user {name}"),
        )),
    }
}
