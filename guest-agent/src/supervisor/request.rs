//! Per-process request queue.
//!
//! The dispatcher submits one [`Request`] at a time through a
//! [`LockedSupervisor`]; the supervisor's worker thread fulfils it and hands
//! back a [`Completion`]. Submission is synchronous: the caller blocks until
//! the completion arrives or its timeout expires.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use guestctl_protocol::{BoundedBuf, ContextToken, ErrorCode, OutputHandle, MAX_OUTPUT_BUFFER};
use tracing::debug;

use super::{Shared, Supervisor, SupervisorState};
use crate::error::SubmitError;

/// Requests queued per supervisor before `submit` reports `Busy`.
pub(crate) const MAILBOX_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    StdinWrite,
    /// Write, then close stdin.
    StdinWriteEof,
    StdoutRead,
    StderrRead,
}

impl RequestKind {
    pub fn is_write(self) -> bool {
        matches!(self, RequestKind::StdinWrite | RequestKind::StdinWriteEof)
    }
}

#[derive(Debug)]
pub struct Request {
    pub kind: RequestKind,
    pub context: ContextToken,
    /// Bytes to write, or the buffer a read fills.
    pub buffer: BoundedBuf,
}

impl Request {
    pub fn stdin(context: ContextToken, data: BoundedBuf, eof: bool) -> Self {
        Self {
            kind: if eof {
                RequestKind::StdinWriteEof
            } else {
                RequestKind::StdinWrite
            },
            context,
            buffer: data,
        }
    }

    pub fn read(context: ContextToken, handle: OutputHandle) -> Self {
        Self {
            kind: if handle.is_stderr() {
                RequestKind::StderrRead
            } else {
                RequestKind::StdoutRead
            },
            context,
            buffer: BoundedBuf::with_capacity(MAX_OUTPUT_BUFFER),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    /// The process or its stdin is gone.
    Terminated,
    /// Refused before touching the process.
    Rejected(ErrorCode),
    /// The pipe operation failed.
    Failed,
}

#[derive(Debug)]
pub struct Completion {
    pub kind: RequestKind,
    pub context: ContextToken,
    pub buffer: BoundedBuf,
    pub transferred: usize,
    pub outcome: RequestOutcome,
}

impl Completion {
    pub(crate) fn new(request: Request, transferred: usize, outcome: RequestOutcome) -> Self {
        Self {
            kind: request.kind,
            context: request.context,
            buffer: request.buffer,
            transferred,
            outcome,
        }
    }

    /// Bytes read, for read requests.
    pub fn data(&self) -> &[u8] {
        if self.kind.is_write() {
            &[]
        } else {
            self.buffer.as_slice()
        }
    }
}

pub(crate) struct Envelope {
    request: Request,
    reply: SyncSender<Completion>,
}

impl Envelope {
    /// Run `fulfil` on the request and send back what it produced.
    pub(crate) fn fulfil_with<F>(self, fulfil: F)
    where
        F: FnOnce(Request) -> Completion,
    {
        let Envelope { request, reply } = self;
        if reply.send(fulfil(request)).is_err() {
            // The submitter timed out and left.
            debug!("completion dropped, submitter gone");
        }
    }

    pub(crate) fn terminate(self) {
        let Envelope { request, reply } = self;
        let _ = reply.send(Completion::new(request, 0, RequestOutcome::Terminated));
    }
}

pub(crate) fn mailbox() -> (SyncSender<Envelope>, Receiver<Envelope>) {
    mpsc::sync_channel(MAILBOX_DEPTH)
}

/// A supervisor found by `Registry::find_and_lock`, with its lock held.
///
/// Holding this borrows the registry mutably, so no registry operation can
/// run until it is submitted or dropped.
pub struct LockedSupervisor<'a> {
    supervisor: &'a Arc<Supervisor>,
    shared: MutexGuard<'a, Shared>,
}

impl<'a> LockedSupervisor<'a> {
    pub(crate) fn new(supervisor: &'a Arc<Supervisor>, shared: MutexGuard<'a, Shared>) -> Self {
        Self { supervisor, shared }
    }

    pub fn pid(&self) -> u32 {
        self.supervisor.pid()
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.state
    }

    /// Queue `request` and block until the worker completes it.
    ///
    /// The supervisor lock is released before blocking.
    pub fn submit(self, request: Request, timeout: Duration) -> Result<Completion, SubmitError> {
        if self.shared.state != SupervisorState::Running {
            return Err(SubmitError::NotRunning);
        }
        let Some(mailbox) = self.shared.mailbox.clone() else {
            return Err(SubmitError::NotRunning);
        };

        let (reply, completion) = mpsc::sync_channel(1);
        match mailbox.try_send(Envelope { request, reply }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => return Err(SubmitError::Busy),
            Err(TrySendError::Disconnected(_)) => return Err(SubmitError::NotRunning),
        }
        drop(self);

        match completion.recv_timeout(timeout) {
            Ok(completion) => Ok(completion),
            Err(RecvTimeoutError::Timeout) => Err(SubmitError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(SubmitError::NotRunning),
        }
    }
}
