use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use guestctl_protocol::{Frame, Message, Param};
use tracing::debug;

use super::{Channel, ChannelError, ClientId, HostMessageHeader};
use crate::sync::lock;

/// In-process stand-in for the host service.
///
/// The guest side goes through the [`Channel`] trait like any transport; the
/// host side pushes messages and inspects the guest's reports directly.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct State {
    unavailable: bool,
    next_client: u32,
    connected: Option<ClientId>,
    inbox: VecDeque<Frame>,
    current: Option<Frame>,
    /// Deliveries that first answer with `TooMuchData`.
    oversized: usize,
    /// The next wait reports a dropped connection.
    severed: bool,
    cancelled: bool,
    reports: Vec<Frame>,
    connects: usize,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel whose `connect` always fails with `ServiceUnavailable`.
    pub fn unavailable() -> Self {
        let channel = Self::default();
        lock(&channel.state).unavailable = true;
        channel
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    // -----------------------------------------------------------------------
    // Host side
    // -----------------------------------------------------------------------

    /// Queue a typed host message.
    pub fn push<M: Message>(&self, msg: &M) {
        self.push_frame(msg.to_frame());
    }

    /// Queue a raw frame, e.g. one with an unknown id or broken params.
    pub fn push_frame(&self, frame: Frame) {
        self.state().inbox.push_back(frame);
        self.cond.notify_all();
    }

    /// Make the next delivery need a second, larger receive.
    pub fn oversize_next(&self) {
        self.state().oversized += 1;
    }

    /// Drop the connection; the guest's next wait sees `Disconnected`.
    pub fn sever(&self) {
        let mut state = self.state();
        state.severed = true;
        state.connected = None;
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected.is_some()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    pub fn was_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Everything the guest sent so far, in order.
    pub fn reports(&self) -> Vec<Frame> {
        self.state().reports.clone()
    }

    /// Reports of one message type, decoded.
    pub fn reports_of<M: Message>(&self) -> Vec<M> {
        self.state()
            .reports
            .iter()
            .filter(|f| f.msg == M::ID)
            .filter_map(|f| M::from_frame(f).ok())
            .collect()
    }

    /// Wait for the first report of type `M` matching `pred`.
    pub fn wait_for_report<M, F>(&self, timeout: Duration, pred: F) -> Option<M>
    where
        M: Message,
        F: Fn(&M) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            let found = state
                .reports
                .iter()
                .filter(|f| f.msg == M::ID)
                .filter_map(|f| M::from_frame(f).ok())
                .find(|m| pred(m));
            if found.is_some() {
                return found;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn check_client(state: &State, client: ClientId) -> Result<(), ChannelError> {
        if state.connected == Some(client) {
            Ok(())
        } else {
            Err(ChannelError::NotConnected(client))
        }
    }
}

impl Channel for MemoryChannel {
    fn connect(&self) -> Result<ClientId, ChannelError> {
        let mut state = self.state();
        if state.unavailable {
            return Err(ChannelError::ServiceUnavailable(
                "in-memory host is not running".into(),
            ));
        }
        state.next_client += 1;
        let client = ClientId(state.next_client);
        state.connected = Some(client);
        state.severed = false;
        state.connects += 1;
        Ok(client)
    }

    fn disconnect(&self, client: ClientId) {
        let mut state = self.state();
        if state.connected == Some(client) {
            state.connected = None;
            state.current = None;
        }
        drop(state);
        self.cond.notify_all();
    }

    fn wait_for_host_message(&self, client: ClientId) -> Result<HostMessageHeader, ChannelError> {
        let mut state = self.state();
        loop {
            if state.severed {
                state.severed = false;
                return Err(ChannelError::Disconnected);
            }
            Self::check_client(&state, client)?;
            if state.cancelled {
                return Err(ChannelError::Cancelled);
            }
            if !state.inbox.is_empty() {
                if state.oversized > 0 {
                    state.oversized -= 1;
                    let needed = state
                        .inbox
                        .front()
                        .and_then(|f| serde_json::to_vec(f).ok())
                        .map_or(0, |v| v.len());
                    return Err(ChannelError::TooMuchData { needed });
                }
                let frame = state.inbox.pop_front().ok_or(ChannelError::NoMessage)?;
                let header = HostMessageHeader {
                    msg_type: frame.msg,
                    param_count: frame.param_count(),
                };
                state.current = Some(frame);
                return Ok(header);
            }
            state = match self.cond.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn fetch_params(&self, client: ClientId) -> Result<Vec<Param>, ChannelError> {
        let mut state = self.state();
        Self::check_client(&state, client)?;
        state
            .current
            .take()
            .map(|f| f.params)
            .ok_or(ChannelError::NoMessage)
    }

    fn cancel_pending_waits(&self, client: ClientId) -> Result<(), ChannelError> {
        let mut state = self.state();
        Self::check_client(&state, client)?;
        state.cancelled = true;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    fn call(&self, msg_type: u32, params: Vec<Param>) -> Result<(), ChannelError> {
        let mut state = self.state();
        if state.connected.is_none() {
            return Err(ChannelError::Disconnected);
        }
        debug!(msg_type, params = params.len(), "guest report");
        state.reports.push(Frame::new(msg_type, params));
        drop(state);
        self.cond.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guestctl_protocol::{CancelPendingWaits, ContextToken, GetOutput, OutputHandle, ReportStatus};
    use std::sync::Arc;

    #[test]
    fn unavailable_host_is_soft_failure() {
        let channel = MemoryChannel::unavailable();
        assert!(channel.connect().unwrap_err().is_service_unavailable());
    }

    #[test]
    fn delivers_messages_in_order() {
        let channel = MemoryChannel::new();
        let client = channel.connect().unwrap();
        let get = GetOutput {
            context: ContextToken(1),
            pid: 2,
            handle: OutputHandle::Stdout,
            flags: 0,
        };
        channel.push(&get);
        channel.push(&CancelPendingWaits);

        let header = channel.wait_for_host_message(client).unwrap();
        assert_eq!(header.msg_type, GetOutput::ID);
        assert_eq!(header.param_count, 4);
        assert_eq!(GetOutput::decode(&channel.fetch_params(client).unwrap()).unwrap(), get);

        let header = channel.wait_for_host_message(client).unwrap();
        assert_eq!(header.msg_type, CancelPendingWaits::ID);
        assert_eq!(header.param_count, 0);
    }

    #[test]
    fn oversized_delivery_retries() {
        let channel = MemoryChannel::new();
        let client = channel.connect().unwrap();
        channel.oversize_next();
        channel.push(&CancelPendingWaits);
        assert!(matches!(
            channel.wait_for_host_message(client),
            Err(ChannelError::TooMuchData { .. })
        ));
        assert!(channel.wait_for_host_message(client).is_ok());
    }

    #[test]
    fn cancel_wakes_waiter() {
        let channel = Arc::new(MemoryChannel::new());
        let client = channel.connect().unwrap();
        let waiter = {
            let channel = channel.clone();
            std::thread::spawn(move || channel.wait_for_host_message(client))
        };
        std::thread::sleep(Duration::from_millis(20));
        channel.cancel_pending_waits(client).unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(ChannelError::Cancelled)));
        assert!(channel.was_cancelled());
    }

    #[test]
    fn sever_reports_disconnect_once() {
        let channel = MemoryChannel::new();
        let client = channel.connect().unwrap();
        channel.sever();
        assert!(matches!(
            channel.wait_for_host_message(client),
            Err(ChannelError::Disconnected)
        ));
        assert!(matches!(
            channel.wait_for_host_message(client),
            Err(ChannelError::NotConnected(_))
        ));
        let again = channel.connect().unwrap();
        assert_ne!(again, client);
        assert_eq!(channel.connect_count(), 2);
    }

    #[test]
    fn records_and_decodes_reports() {
        let channel = MemoryChannel::new();
        channel.connect().unwrap();
        let report = ReportStatus::started(ContextToken(5), 99);
        channel.call(ReportStatus::ID, report.encode()).unwrap();
        assert_eq!(channel.reports().len(), 1);
        assert_eq!(channel.reports_of::<ReportStatus>(), vec![report.clone()]);
        assert_eq!(
            channel.wait_for_report::<ReportStatus, _>(Duration::ZERO, |r| r.pid == 99),
            Some(report)
        );
        assert!(channel
            .wait_for_report::<ReportStatus, _>(Duration::from_millis(10), |r| r.pid == 1)
            .is_none());
    }

    #[test]
    fn call_without_connection_fails() {
        let channel = MemoryChannel::new();
        assert!(matches!(
            channel.call(ReportStatus::ID, vec![]),
            Err(ChannelError::Disconnected)
        ));
    }
}
