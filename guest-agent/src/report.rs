use std::sync::Arc;

use guestctl_protocol::{
    ContextToken, ErrorCode, InputStatus, Message, OutputHandle, ProcessStatus, ReportInputStatus,
    ReportOutput, ReportStatus,
};
use tracing::{debug, warn};

use crate::channel::Channel;

/// Sends guest reports to the host.
///
/// A failed send is logged and otherwise ignored: the host is gone or the
/// session is being replaced, and nothing on the guest side can retry it.
#[derive(Clone)]
pub struct HostReporter {
    channel: Arc<dyn Channel>,
}

impl HostReporter {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    /// Returns whether the message reached the transport.
    pub fn send<M: Message + std::fmt::Debug>(&self, msg: &M) -> bool {
        match self.channel.call(M::ID, msg.encode()) {
            Ok(()) => {
                debug!(msg_type = M::ID, ?msg, "report sent");
                true
            }
            Err(e) => {
                warn!(msg_type = M::ID, error = %e, "failed to send report to host");
                false
            }
        }
    }

    pub fn status(
        &self,
        context: ContextToken,
        pid: u32,
        status: ProcessStatus,
        flags: u32,
    ) -> bool {
        self.send(&ReportStatus {
            context,
            pid,
            status,
            flags,
            data: Vec::new(),
        })
    }

    pub fn error(&self, context: ContextToken, pid: u32, code: ErrorCode, message: &str) -> bool {
        self.send(&ReportStatus::error(context, pid, code, message))
    }

    pub fn output(
        &self,
        context: ContextToken,
        pid: u32,
        handle: OutputHandle,
        flags: u32,
        data: Vec<u8>,
    ) -> bool {
        self.send(&ReportOutput {
            context,
            pid,
            handle,
            flags,
            data,
        })
    }

    pub fn input_status(
        &self,
        context: ContextToken,
        pid: u32,
        status: InputStatus,
        flags: u32,
        written: u32,
    ) -> bool {
        self.send(&ReportInputStatus {
            context,
            pid,
            status,
            flags,
            written,
        })
    }
}

impl std::fmt::Debug for HostReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    #[test]
    fn sends_typed_reports() {
        let channel = Arc::new(MemoryChannel::new());
        channel.connect().unwrap();
        let reporter = HostReporter::new(channel.clone());

        assert!(reporter.status(ContextToken(1), 10, ProcessStatus::TerminatedNormally, 3));
        assert!(reporter.input_status(ContextToken(2), 10, InputStatus::Written, 0, 5));
        assert!(reporter.output(ContextToken(3), 10, OutputHandle::Stderr, 0, b"err".to_vec()));

        let status = channel.reports_of::<ReportStatus>();
        assert_eq!(status[0].flags, 3);
        let input = channel.reports_of::<ReportInputStatus>();
        assert_eq!(input[0].written, 5);
        let output = channel.reports_of::<ReportOutput>();
        assert_eq!(output[0].data, b"err");
    }

    #[test]
    fn failed_send_is_not_fatal() {
        let channel = Arc::new(MemoryChannel::new());
        let reporter = HostReporter::new(channel);
        assert!(!reporter.error(ContextToken(1), 0, ErrorCode::Internal, "nobody listening"));
    }
}
