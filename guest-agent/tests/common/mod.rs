//! Shared fixtures: a scripted process launcher and a dispatcher harness
//! driven through `MemoryChannel`.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use guestctl_agent::config::ControlConfig;
use guestctl_agent::platform::{ExitState, GuestProcess, OutputStream, ProcessLauncher};
use guestctl_agent::{Dispatcher, MemoryChannel, Registry, ShutdownHandle};
use guestctl_protocol::{
    ContextToken, ExecStart, GuestProcessSpec, Message, ProcessStatus, ReportStatus,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config(max_processes: u32) -> ControlConfig {
    ControlConfig {
        max_processes,
        poll_interval_ms: 10,
        read_timeout_ms: 10,
        request_timeout_secs: 5,
        reap_wait_secs: 1,
        shutdown_wait_secs: 5,
        retry_delay_ms: 10,
    }
}

// ---------------------------------------------------------------------------
// Scripted processes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptState {
    exit: Option<ExitState>,
    killed: bool,
    stdin: Vec<u8>,
    stdin_closed: bool,
    stdout: VecDeque<u8>,
    kill_stall: Option<Duration>,
    detached: bool,
}

/// Test-side view of one scripted process.
#[derive(Clone)]
pub struct ScriptHandle {
    os_pid: u32,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap()
    }

    pub fn os_pid(&self) -> u32 {
        self.os_pid
    }

    pub fn exit(&self, code: i32) {
        self.state().exit = Some(ExitState::Exited(code));
    }

    pub fn push_stdout(&self, data: &[u8]) {
        self.state().stdout.extend(data);
    }

    pub fn stdin(&self) -> Vec<u8> {
        self.state().stdin.clone()
    }

    pub fn stdin_closed(&self) -> bool {
        self.state().stdin_closed
    }

    pub fn was_killed(&self) -> bool {
        self.state().killed
    }

    pub fn was_detached(&self) -> bool {
        self.state().detached
    }

    /// Make `kill` hang for `stall` before it takes effect.
    pub fn stall_kill(&self, stall: Duration) {
        self.state().kill_stall = Some(stall);
    }
}

struct ScriptedProcess {
    handle: ScriptHandle,
}

impl GuestProcess for ScriptedProcess {
    fn os_pid(&self) -> u32 {
        self.handle.os_pid
    }

    fn write_stdin(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.handle.state();
        if state.stdin_closed || state.exit.is_some() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        state.stdin.extend_from_slice(data);
        Ok(data.len())
    }

    fn close_stdin(&mut self) {
        self.handle.state().stdin_closed = true;
    }

    fn read_output(
        &mut self,
        stream: OutputStream,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> io::Result<usize> {
        if stream == OutputStream::Stderr {
            return Ok(0);
        }
        let mut state = self.handle.state();
        let n = buf.len().min(state.stdout.len());
        for (slot, byte) in buf.iter_mut().zip(state.stdout.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn at_eof(&self, _stream: OutputStream) -> bool {
        self.handle.state().stdout.is_empty()
    }

    fn try_wait(&mut self) -> io::Result<Option<ExitState>> {
        Ok(self.handle.state().exit)
    }

    fn kill(&mut self) -> io::Result<ExitState> {
        let stall = self.handle.state().kill_stall;
        if let Some(stall) = stall {
            std::thread::sleep(stall);
        }
        let mut state = self.handle.state();
        state.killed = true;
        // SIGKILL unless it already exited.
        let exit = *state.exit.get_or_insert(ExitState::Signaled(9));
        Ok(exit)
    }

    fn detach(self: Box<Self>) {
        self.handle.state().detached = true;
    }
}

/// Launches scripted processes whose lifecycle the test drives.
pub struct ScriptedLauncher {
    next_os_pid: AtomicU32,
    fixed_os_pid: Option<u32>,
    launched: Mutex<Vec<ScriptHandle>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            next_os_pid: AtomicU32::new(1000),
            fixed_os_pid: None,
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Every process claims the same OS pid.
    pub fn with_fixed_os_pid(os_pid: u32) -> Self {
        Self {
            fixed_os_pid: Some(os_pid),
            ..Self::new()
        }
    }

    pub fn launched(&self) -> Vec<ScriptHandle> {
        self.launched.lock().unwrap().clone()
    }

    pub fn handle(&self, index: usize) -> ScriptHandle {
        self.launched()[index].clone()
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, spec: &GuestProcessSpec) -> io::Result<Box<dyn GuestProcess>> {
        if spec.command.starts_with("/missing") {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        let os_pid = self
            .fixed_os_pid
            .unwrap_or_else(|| self.next_os_pid.fetch_add(1, Ordering::SeqCst));
        let handle = ScriptHandle {
            os_pid,
            state: Arc::default(),
        };
        self.launched.lock().unwrap().push(handle.clone());
        Ok(Box::new(ScriptedProcess { handle }))
    }
}

// ---------------------------------------------------------------------------
// Dispatcher harness
// ---------------------------------------------------------------------------

/// A dispatcher running on its own thread against an in-memory host.
pub struct Harness {
    pub channel: Arc<MemoryChannel>,
    pub registry: Registry,
    shutdown: ShutdownHandle,
    thread: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn start(launcher: Arc<dyn ProcessLauncher>, config: ControlConfig) -> Self {
        let channel = Arc::new(MemoryChannel::new());
        let dispatcher = Dispatcher::connect(channel.clone(), launcher, config)
            .unwrap()
            .expect("in-memory host is available");
        let registry = dispatcher.registry().clone();
        let shutdown = dispatcher.shutdown_handle();
        let thread = std::thread::spawn(move || dispatcher.run());
        Self {
            channel,
            registry,
            shutdown,
            thread: Some(thread),
        }
    }

    /// Start `spec` and return the reply to its `ExecStart`.
    pub fn exec(&self, context: u32, spec: GuestProcessSpec) -> ReportStatus {
        self.channel.push(&ExecStart {
            context: ContextToken(context),
            spec,
        });
        self.status(context, |r| {
            matches!(r.status, ProcessStatus::Started | ProcessStatus::Error)
        })
    }

    /// First status report for `context` matching `pred`.
    pub fn status(&self, context: u32, pred: impl Fn(&ReportStatus) -> bool) -> ReportStatus {
        self.channel
            .wait_for_report::<ReportStatus, _>(WAIT, |r| {
                r.context == ContextToken(context) && pred(r)
            })
            .unwrap_or_else(|| panic!("no matching status for context {context}"))
    }

    pub fn stop(mut self) {
        self.shutdown.trigger();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.shutdown.trigger();
            let _ = thread.join();
        }
    }
}

/// Poll `cond` until it holds or `WAIT` runs out.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Wait until exactly `count` reports of type `M` arrived, then make sure no
/// extra one follows.
pub fn collect<M: Message>(channel: &MemoryChannel, count: usize) -> Vec<M> {
    wait_until(|| channel.reports_of::<M>().len() >= count);
    std::thread::sleep(Duration::from_millis(100));
    channel.reports_of::<M>()
}

pub fn sh(script: &str) -> GuestProcessSpec {
    let mut spec = GuestProcessSpec::new("/bin/sh");
    spec.args = vec!["sh".into(), "-c".into(), script.into()];
    spec
}
