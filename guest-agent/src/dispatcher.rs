//! Host command loop.
//!
//! The dispatcher owns the channel session and the registry. It waits for one
//! host message at a time, routes it, and answers every request that carries
//! a context token with exactly one report.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use guestctl_protocol::{
    peek_context, peek_pid, ErrorCode, ExecStart, GetOutput, HostMessageType, InputStatus,
    Message, OutputHandle, Param, ReportStatus, SetInput,
};
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelError, ClientId, HostMessageHeader};
use crate::config::ControlConfig;
use crate::error::SubmitError;
use crate::platform::ProcessLauncher;
use crate::registry::Registry;
use crate::report::HostReporter;
use crate::supervisor::{Request, RequestOutcome, Supervisor, SupervisorSettings};
use crate::sync::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Running,
    ShuttingDown,
}

// ---------------------------------------------------------------------------
// Shutdown handle
// ---------------------------------------------------------------------------

/// Stops a running dispatcher from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: Mutex<bool>,
    cond: Condvar,
    client: AtomicU32,
    channel: Arc<dyn Channel>,
}

impl ShutdownHandle {
    fn new(channel: Arc<dyn Channel>, client: ClientId) -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: Mutex::new(false),
                cond: Condvar::new(),
                client: AtomicU32::new(client.0),
                channel,
            }),
        }
    }

    /// Set the shutdown flag and wake the dispatcher's pending wait.
    pub fn trigger(&self) {
        *lock(&self.inner.flag) = true;
        self.inner.cond.notify_all();
        let client = ClientId(self.inner.client.load(Ordering::SeqCst));
        if let Err(e) = self.inner.channel.cancel_pending_waits(client) {
            debug!(client = %client, error = %e, "cancel pending waits failed");
        }
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.inner.flag)
    }

    fn set_client(&self, client: ClientId) {
        self.inner.client.store(client.0, Ordering::SeqCst);
    }

    /// Sleep for `duration` or until shutdown. Returns true on shutdown.
    fn sleep(&self, duration: Duration) -> bool {
        let flag = lock(&self.inner.flag);
        let (flag, _) = match self.inner.cond.wait_timeout_while(flag, duration, |set| !*set) {
            Ok(result) => result,
            Err(poisoned) => poisoned.into_inner(),
        };
        *flag
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("set", &self.is_set())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    client: ClientId,
    registry: Registry,
    launcher: Arc<dyn ProcessLauncher>,
    reporter: HostReporter,
    config: ControlConfig,
    shutdown: ShutdownHandle,
    state: DispatcherState,
}

impl Dispatcher {
    /// Open a session with the host.
    ///
    /// Returns `Ok(None)` when the host service is absent; the caller should
    /// run without exec control rather than fail.
    pub fn connect(
        channel: Arc<dyn Channel>,
        launcher: Arc<dyn ProcessLauncher>,
        config: ControlConfig,
    ) -> Result<Option<Self>, ChannelError> {
        let client = match channel.connect() {
            Ok(client) => client,
            Err(e) if e.is_service_unavailable() => {
                warn!(error = %e, "exec control disabled");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        info!(
            client = %client,
            max_processes = config.max_processes,
            "connected to host control service"
        );

        Ok(Some(Self {
            registry: Registry::new(config.max_processes),
            reporter: HostReporter::new(channel.clone()),
            shutdown: ShutdownHandle::new(channel.clone(), client),
            channel,
            client,
            launcher,
            config,
            state: DispatcherState::Running,
        }))
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Serve host messages until shutdown, then stop every process.
    pub fn run(mut self) {
        while self.state == DispatcherState::Running {
            self.poll_once();
            let reaped = self.registry.reap_inactive(self.config.reap_wait());
            if reaped > 0 {
                debug!(reaped, "reaped finished supervisors");
            }
        }
        self.finish();
    }

    /// Wait for and handle one host message.
    pub fn poll_once(&mut self) -> DispatcherState {
        if self.shutdown.is_set() {
            self.state = DispatcherState::ShuttingDown;
            return self.state;
        }

        match self.channel.wait_for_host_message(self.client) {
            Ok(header) => self.dispatch(header),
            Err(ChannelError::TooMuchData { needed }) => {
                debug!(needed, "host message needs a larger buffer, retrying");
            }
            Err(ChannelError::Cancelled) => {
                info!("pending waits cancelled, shutting down");
                self.state = DispatcherState::ShuttingDown;
            }
            Err(ChannelError::Disconnected) => {
                warn!(client = %self.client, "host closed the control channel");
                self.channel.disconnect(self.client);
                self.reconnect();
            }
            Err(e) => {
                warn!(error = %e, "waiting for host message failed");
                if self.shutdown.sleep(self.config.retry_delay()) {
                    self.state = DispatcherState::ShuttingDown;
                }
            }
        }
        self.state
    }

    fn reconnect(&mut self) {
        loop {
            if self.shutdown.sleep(self.config.retry_delay()) {
                self.state = DispatcherState::ShuttingDown;
                return;
            }
            match self.channel.connect() {
                Ok(client) => {
                    info!(client = %client, "reconnected to host control service");
                    self.client = client;
                    self.shutdown.set_client(client);
                    return;
                }
                Err(e) => debug!(error = %e, "reconnect failed"),
            }
        }
    }

    fn finish(self) {
        info!(
            active = self.registry.active_count(),
            "shutting down exec control"
        );
        self.registry.shutdown_all(self.config.shutdown_wait());
        self.channel.disconnect(self.client);
        info!("exec control stopped");
    }

    fn dispatch(&mut self, header: HostMessageHeader) {
        let params = match self.channel.fetch_params(self.client) {
            Ok(params) => params,
            Err(e) => {
                warn!(msg_type = header.msg_type, error = %e, "failed to fetch message parameters");
                return;
            }
        };

        match HostMessageType::from_id(header.msg_type) {
            Some(HostMessageType::ExecStart) => self.handle_exec_start(&params),
            Some(HostMessageType::SetInput) => self.handle_set_input(&params),
            Some(HostMessageType::GetOutput) => self.handle_get_output(&params),
            Some(HostMessageType::CancelPendingWaits) => {
                info!("host requested shutdown");
                self.state = DispatcherState::ShuttingDown;
            }
            None => warn!(
                msg_type = header.msg_type,
                param_count = header.param_count,
                "ignoring unknown host message"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    fn handle_exec_start(&mut self, params: &[Param]) {
        let msg = match ExecStart::decode(params) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed exec start");
                if let Some(context) = peek_context(params) {
                    self.reporter.send(&ReportStatus::error(
                        context,
                        0,
                        e.error_code(),
                        &e.to_string(),
                    ));
                }
                return;
            }
        };

        let context = msg.context;
        debug!(context = %context, spec = ?msg.spec, "exec start");
        match Supervisor::start(
            msg.spec,
            context,
            &self.registry,
            self.launcher.as_ref(),
            self.reporter.clone(),
            SupervisorSettings::from(&self.config),
        ) {
            Ok(launched) => {
                self.reporter.send(&ReportStatus::started(context, launched.pid()));
                launched.release();
            }
            Err(e) => {
                warn!(context = %context, error = %e, "exec start failed");
                self.reporter.error(context, 0, e.error_code(), &e.to_string());
            }
        }
    }

    fn handle_set_input(&mut self, params: &[Param]) {
        let msg = match SetInput::decode(params) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed set input");
                if let Some(context) = peek_context(params) {
                    let pid = peek_pid(params).unwrap_or(0);
                    let (status, flags) = if e.is_overflow() {
                        (InputStatus::Overflow, 0)
                    } else {
                        (InputStatus::Error, e.error_code().code())
                    };
                    self.reporter.input_status(context, pid, status, flags, 0);
                }
                return;
            }
        };

        let SetInput {
            context,
            pid,
            flags,
            data,
        } = msg;
        let eof = flags.is_eof();
        let timeout = self.config.request_timeout();
        let Some(target) = self.registry.find_and_lock(pid) else {
            debug!(context = %context, pid, "set input for untracked pid");
            self.reporter
                .input_status(context, pid, InputStatus::Terminated, 0, 0);
            return;
        };

        let (status, flags, written) = match target.submit(Request::stdin(context, data, eof), timeout) {
            Ok(completion) => match completion.outcome {
                RequestOutcome::Completed => (
                    InputStatus::Written,
                    0,
                    u32::try_from(completion.transferred).unwrap_or(u32::MAX),
                ),
                RequestOutcome::Terminated => (InputStatus::Terminated, 0, 0),
                RequestOutcome::Rejected(code) => (InputStatus::Error, code.code(), 0),
                RequestOutcome::Failed => (InputStatus::Error, ErrorCode::Io.code(), 0),
            },
            Err(SubmitError::NotRunning) => (InputStatus::Terminated, 0, 0),
            Err(e) => {
                warn!(context = %context, pid, error = %e, "set input not completed");
                (InputStatus::Error, e.error_code().code(), 0)
            }
        };
        self.reporter
            .input_status(context, pid, status, flags, written);
    }

    fn handle_get_output(&mut self, params: &[Param]) {
        let msg = match GetOutput::decode(params) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed get output");
                if let Some(context) = peek_context(params) {
                    let pid = peek_pid(params).unwrap_or(0);
                    self.reporter.output(
                        context,
                        pid,
                        OutputHandle::Stdout,
                        e.error_code().code(),
                        Vec::new(),
                    );
                }
                return;
            }
        };

        let GetOutput {
            context,
            pid,
            handle,
            ..
        } = msg;
        let timeout = self.config.request_timeout();
        let Some(target) = self.registry.find_and_lock(pid) else {
            debug!(context = %context, pid, "get output for untracked pid");
            self.reporter.output(context, pid, handle, 0, Vec::new());
            return;
        };

        let (flags, data) = match target.submit(Request::read(context, handle), timeout) {
            Ok(completion) => match completion.outcome {
                RequestOutcome::Completed => (0, completion.buffer.into_vec()),
                RequestOutcome::Terminated => (0, Vec::new()),
                RequestOutcome::Rejected(code) => (code.code(), Vec::new()),
                RequestOutcome::Failed => (ErrorCode::Io.code(), Vec::new()),
            },
            Err(SubmitError::NotRunning) => (0, Vec::new()),
            Err(e) => {
                warn!(context = %context, pid, error = %e, "get output not completed");
                (e.error_code().code(), Vec::new())
            }
        };
        self.reporter.output(context, pid, handle, flags, data);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("client", &self.client)
            .field("state", &self.state)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
