//! Registry behavior when supervisor workers do not stop in time.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use guestctl_agent::{
    Channel, HostReporter, ListKind, MemoryChannel, Registry, Supervisor, SupervisorSettings,
    SupervisorState,
};
use guestctl_protocol::{ContextToken, GuestProcessSpec, ProcessStatus, ReportStatus};

use common::{test_config, wait_until, ScriptedLauncher, WAIT};

/// Start a scripted process whose `kill` hangs for `stall`.
fn start_stuck(registry: &Registry, stall: Duration) -> (Arc<MemoryChannel>, Arc<Supervisor>) {
    let channel = Arc::new(MemoryChannel::new());
    channel.connect().unwrap();
    let launcher = ScriptedLauncher::new();
    let launched = Supervisor::start(
        GuestProcessSpec::new("/bin/fake"),
        ContextToken(1),
        registry,
        &launcher,
        HostReporter::new(channel.clone()),
        SupervisorSettings::from(&test_config(0)),
    )
    .unwrap();
    launcher.handle(0).stall_kill(stall);
    let supervisor = launched.supervisor().clone();
    launched.release();
    (channel, supervisor)
}

#[test]
fn shutdown_detaches_worker_that_does_not_stop() {
    let registry = Registry::new(0);
    let (channel, supervisor) = start_stuck(&registry, Duration::from_secs(2));

    let began = Instant::now();
    registry.shutdown_all(Duration::from_millis(200));
    assert!(began.elapsed() < Duration::from_millis(1500));
    assert_eq!(registry.active_count(), 0);
    assert_eq!(registry.inactive_count(), 0);
    assert_eq!(supervisor.membership(), None);

    // The detached worker still winds down on its own without relisting.
    assert!(supervisor.wait_finished(WAIT));
    assert_eq!(registry.inactive_count(), 0);
    let down = channel.wait_for_report::<ReportStatus, _>(WAIT, |r| {
        r.context == ContextToken(1) && r.status == ProcessStatus::Down
    });
    assert!(down.is_some());
}

#[test]
fn reap_keeps_entry_whose_worker_is_still_busy() {
    let registry = Registry::new(1);
    let (_channel, supervisor) = start_stuck(&registry, Duration::from_secs(1));

    supervisor.request_stop();
    assert!(wait_until(|| registry.inactive_count() == 1));
    // Leaving the active list already freed the slot.
    assert!(registry.admission_check());

    let began = Instant::now();
    assert_eq!(registry.reap_inactive(Duration::from_millis(50)), 0);
    assert!(began.elapsed() < Duration::from_millis(500));
    assert_eq!(registry.inactive_count(), 1);
    assert_eq!(supervisor.membership(), Some(ListKind::Inactive));

    assert!(supervisor.wait_finished(WAIT));
    assert_eq!(registry.reap_inactive(WAIT), 1);
    assert_eq!(registry.inactive_count(), 0);
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
}
