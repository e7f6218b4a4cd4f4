//! One supervisor per guest process.
//!
//! A supervisor owns the process handle on a dedicated OS thread. The thread
//! fulfils queued requests in order and watches for exit and the time limit.
//! When the process ends the supervisor moves to the registry's inactive
//! list, reports the final status to the host, and keeps serving output
//! reads until captured output runs dry. Reaping happens after that.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use guestctl_protocol::{
    ContextToken, ErrorCode, ExecFlags, GuestProcessSpec, ProcessStatus, MAX_INPUT_BUFFER,
};
use tracing::{debug, error, info, warn};

use crate::config::ControlConfig;
use crate::error::StartError;
use crate::platform::{ExitState, GuestProcess, OutputStream, ProcessLauncher};
use crate::registry::{ListKind, Registry};
use crate::report::HostReporter;
use crate::sync::{lock, Latch};

mod request;

pub use request::{Completion, LockedSupervisor, Request, RequestKind, RequestOutcome};
use request::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Timing knobs for supervisor workers.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub read_timeout: Duration,
    /// How long an exited process stays readable while captured output remains.
    pub output_linger: Duration,
}

impl From<&ControlConfig> for SupervisorSettings {
    fn from(config: &ControlConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            read_timeout: config.read_timeout(),
            output_linger: config.request_timeout(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self::from(&ControlConfig::default())
    }
}

const NOT_LISTED: u8 = 0;
const LISTED_ACTIVE: u8 = 1;
const LISTED_INACTIVE: u8 = 2;

pub struct Supervisor {
    pid: AtomicU32,
    os_pid: u32,
    context: ContextToken,
    spec: GuestProcessSpec,
    membership: AtomicU8,
    shared: Mutex<Shared>,
    stop: AtomicBool,
    finished: Latch,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// State guarded by the supervisor's own lock.
pub(crate) struct Shared {
    state: SupervisorState,
    mailbox: Option<SyncSender<Envelope>>,
}

impl Supervisor {
    /// Admit, spawn and register a new process.
    ///
    /// The worker does not look at the process until the returned
    /// [`Launched`] is released, so the caller can report `Started` first.
    pub fn start(
        spec: GuestProcessSpec,
        context: ContextToken,
        registry: &Registry,
        launcher: &dyn ProcessLauncher,
        reporter: HostReporter,
        settings: SupervisorSettings,
    ) -> Result<Launched, StartError> {
        let reservation = registry.reserve().ok_or(StartError::AdmissionDenied {
            limit: registry.max_processes(),
        })?;

        let mut process = launcher.launch(&spec).map_err(|source| StartError::Spawn {
            command: spec.command.clone(),
            source,
        })?;
        let os_pid = process.os_pid();

        let supervisor = Arc::new(Supervisor {
            pid: AtomicU32::new(0),
            os_pid,
            context,
            spec,
            membership: AtomicU8::new(NOT_LISTED),
            shared: Mutex::new(Shared {
                state: SupervisorState::Starting,
                mailbox: None,
            }),
            stop: AtomicBool::new(false),
            finished: Latch::new(),
            worker: Mutex::new(None),
        });

        let pid = match registry.register(reservation, &supervisor, os_pid) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = process.kill();
                return Err(e.into());
            }
        };

        let (mailbox, inbox) = request::mailbox();
        let (handoff_tx, handoff_rx) = mpsc::sync_channel(1);
        let worker = Worker {
            supervisor: supervisor.clone(),
            inbox,
            handoff: handoff_rx,
            registry: registry.clone(),
            reporter,
            settings,
        };
        let spawned = std::thread::Builder::new()
            .name(format!("guestctl-pid-{pid}"))
            .spawn(move || worker.run());
        match spawned {
            Ok(handle) => *lock(&supervisor.worker) = Some(handle),
            Err(e) => {
                error!(pid, error = %e, "failed to spawn supervisor thread");
                let _ = process.kill();
                registry.move_to(&supervisor, ListKind::Inactive);
                supervisor.finished.set();
                return Err(StartError::Worker(e));
            }
        }

        {
            let mut shared = lock(&supervisor.shared);
            shared.state = SupervisorState::Running;
            shared.mailbox = Some(mailbox);
        }
        info!(
            pid,
            os_pid,
            context = %context,
            command = %supervisor.spec.command,
            "process started"
        );

        Ok(Launched {
            supervisor,
            handoff: Some((handoff_tx, process)),
        })
    }

    /// Host-visible PID.
    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub(crate) fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn os_pid(&self) -> u32 {
        self.os_pid
    }

    /// Token of the `ExecStart` that created this supervisor.
    pub fn context(&self) -> ContextToken {
        self.context
    }

    pub fn spec(&self) -> &GuestProcessSpec {
        &self.spec
    }

    pub fn state(&self) -> SupervisorState {
        lock(&self.shared).state
    }

    pub fn membership(&self) -> Option<ListKind> {
        match self.membership.load(Ordering::SeqCst) {
            LISTED_ACTIVE => Some(ListKind::Active),
            LISTED_INACTIVE => Some(ListKind::Inactive),
            _ => None,
        }
    }

    /// Only the registry changes membership, under its lock.
    pub(crate) fn set_membership(&self, list: Option<ListKind>) {
        let raw = match list {
            None => NOT_LISTED,
            Some(ListKind::Active) => LISTED_ACTIVE,
            Some(ListKind::Inactive) => LISTED_INACTIVE,
        };
        self.membership.store(raw, Ordering::SeqCst);
    }

    pub(crate) fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.finished.wait(timeout)
    }

    /// Join the worker thread, waiting at most `timeout` for it to exit.
    /// A thread that does not exit in time is detached.
    pub(crate) fn join_worker(&self, timeout: Duration) -> bool {
        let Some(handle) = lock(&self.worker).take() else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        if handle.join().is_err() {
            error!(pid = self.pid(), "supervisor thread panicked");
        }
        true
    }

    pub(crate) fn mark_stopped(&self) {
        lock(&self.shared).state = SupervisorState::Stopped;
    }

    /// Refuse new requests from here on.
    fn enter_stopping(&self) {
        let mut shared = lock(&self.shared);
        shared.state = SupervisorState::Stopping;
        shared.mailbox = None;
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pid", &self.pid())
            .field("os_pid", &self.os_pid)
            .field("context", &self.context)
            .field("command", &self.spec.command)
            .field("membership", &self.membership())
            .finish_non_exhaustive()
    }
}

/// A started supervisor whose worker waits for the process handle.
///
/// Releasing (or dropping) it lets the worker begin.
pub struct Launched {
    supervisor: Arc<Supervisor>,
    handoff: Option<(SyncSender<Box<dyn GuestProcess>>, Box<dyn GuestProcess>)>,
}

impl Launched {
    pub fn pid(&self) -> u32 {
        self.supervisor.pid()
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn release(mut self) {
        self.hand_off();
    }

    fn hand_off(&mut self) {
        if let Some((tx, process)) = self.handoff.take() {
            if let Err(mpsc::SendError(mut process)) = tx.send(process) {
                error!(pid = self.supervisor.pid(), "supervisor worker gone, killing process");
                let _ = process.kill();
            }
        }
    }
}

impl Drop for Launched {
    fn drop(&mut self) {
        self.hand_off();
    }
}

struct Worker {
    supervisor: Arc<Supervisor>,
    inbox: Receiver<Envelope>,
    handoff: Receiver<Box<dyn GuestProcess>>,
    registry: Registry,
    reporter: HostReporter,
    settings: SupervisorSettings,
}

impl Worker {
    fn run(self) {
        let pid = self.supervisor.pid();
        let Ok(mut process) = self.handoff.recv() else {
            warn!(pid, "supervisor released without a process");
            self.finish();
            return;
        };

        let started = Instant::now();
        let mut exited_at: Option<Instant> = None;
        loop {
            match self.inbox.recv_timeout(self.settings.poll_interval) {
                Ok(envelope) => {
                    envelope.fulfil_with(|request| self.fulfil(&mut *process, request));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(pid, "request queue closed unexpectedly");
                    self.supervisor.request_stop();
                }
            }

            if exited_at.is_none() {
                if let Some((status, flags)) = self.check_process(&mut *process, started) {
                    // Free the budget slot before the host hears about the exit.
                    self.registry.retire(&self.supervisor);
                    info!(pid, ?status, flags, "process ended");
                    self.reporter.status(self.supervisor.context, pid, status, flags);
                    exited_at = Some(Instant::now());
                }
            }

            if let Some(at) = exited_at {
                if self.supervisor.stop_requested()
                    || !process.has_pending_output()
                    || at.elapsed() >= self.settings.output_linger
                {
                    break;
                }
            }
        }

        let orphaned = self.supervisor.stop_requested()
            && self
                .supervisor
                .spec
                .flags
                .contains(ExecFlags::IGNORE_ORPHANED_PROCESSES);
        if orphaned {
            process.detach();
        } else {
            drop(process);
        }
        self.finish();
    }

    /// Final status if the process is done (or was just made done).
    fn check_process(
        &self,
        process: &mut dyn GuestProcess,
        started: Instant,
    ) -> Option<(ProcessStatus, u32)> {
        let pid = self.supervisor.pid();
        let spec = &self.supervisor.spec;

        if self.supervisor.stop_requested() {
            self.supervisor.enter_stopping();
            self.registry.retire(&self.supervisor);
            if spec.flags.contains(ExecFlags::IGNORE_ORPHANED_PROCESSES) {
                info!(pid, os_pid = process.os_pid(), "leaving orphaned process running");
            } else if let Err(e) = process.kill() {
                warn!(pid, error = %e, "failed to kill process on stop");
            }
            return Some((ProcessStatus::Down, 0));
        }

        match process.try_wait() {
            Ok(Some(state)) => Some(exit_status(state)),
            Ok(None) => {
                let limit = Duration::from_millis(u64::from(spec.time_limit_ms));
                if spec.time_limit_ms != 0 && started.elapsed() >= limit {
                    warn!(pid, limit_ms = spec.time_limit_ms, "time limit reached, killing process");
                    if let Err(e) = process.kill() {
                        warn!(pid, error = %e, "failed to kill process after time limit");
                    }
                    return Some((ProcessStatus::TimedOutKilled, 0));
                }
                None
            }
            Err(e) => {
                error!(pid, error = %e, "failed to query process state");
                let _ = process.kill();
                Some((ProcessStatus::TerminatedAbnormally, 0))
            }
        }
    }

    fn fulfil(&self, process: &mut dyn GuestProcess, mut request: Request) -> Completion {
        let pid = self.supervisor.pid();
        match request.kind {
            RequestKind::StdinWrite | RequestKind::StdinWriteEof => {
                if request.buffer.len() > MAX_INPUT_BUFFER {
                    return Completion::new(
                        request,
                        0,
                        RequestOutcome::Rejected(ErrorCode::InvalidParameter),
                    );
                }
                let (written, outcome) = match process.write_stdin(request.buffer.as_slice()) {
                    Ok(n) => (n, RequestOutcome::Completed),
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        (0, RequestOutcome::Terminated)
                    }
                    Err(e) => {
                        warn!(pid, error = %e, "stdin write failed");
                        (0, RequestOutcome::Failed)
                    }
                };
                // A short write keeps stdin open; the host resends the rest with EOF.
                if request.kind == RequestKind::StdinWriteEof && written == request.buffer.len() {
                    process.close_stdin();
                    debug!(pid, "stdin closed");
                }
                Completion::new(request, written, outcome)
            }
            RequestKind::StdoutRead | RequestKind::StderrRead => {
                let stream = if request.kind == RequestKind::StderrRead {
                    OutputStream::Stderr
                } else {
                    OutputStream::Stdout
                };
                let timeout = self.settings.read_timeout;
                match request
                    .buffer
                    .fill_with(|scratch| process.read_output(stream, scratch, timeout))
                {
                    Ok(n) => Completion::new(request, n, RequestOutcome::Completed),
                    Err(e) => {
                        warn!(pid, ?stream, error = %e, "output read failed");
                        Completion::new(request, 0, RequestOutcome::Failed)
                    }
                }
            }
        }
    }

    /// Stop taking requests, fail queued ones, leave the active list if
    /// still on it.
    fn finish(self) {
        let pid = self.supervisor.pid();
        self.supervisor.enter_stopping();

        let mut failed = 0usize;
        while let Ok(envelope) = self.inbox.try_recv() {
            envelope.terminate();
            failed += 1;
        }
        if failed > 0 {
            debug!(pid, failed, "failed requests queued behind exit");
        }

        self.registry.retire(&self.supervisor);
        self.supervisor.finished.set();
        debug!(pid, "supervisor finished");
    }
}

fn exit_status(state: ExitState) -> (ProcessStatus, u32) {
    match state {
        ExitState::Exited(code) => (ProcessStatus::TerminatedNormally, code as u32),
        ExitState::Signaled(signal) => (ProcessStatus::TerminatedSignal, signal as u32),
        ExitState::Abnormal => (ProcessStatus::TerminatedAbnormally, 0),
    }
}
