//! Admission-controlled set of process supervisors.
//!
//! Supervisors live on one of two lists. `Active` holds live processes and
//! is what the budget counts. A worker moves its supervisor to `Inactive` as
//! soon as the process is done; it stays addressable there while its worker
//! still serves output reads. Reaping joins the worker and drops the entry.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::supervisor::{LockedSupervisor, Supervisor, SupervisorState};
use crate::sync::lock;

/// Added to a colliding PID until a free one turns up.
const PID_STEP: u32 = 391;

/// Minimum per-entry wait for the reap pass at the end of shutdown.
const FINAL_REAP_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Active,
    Inactive,
}

#[derive(Default)]
struct Lists {
    active: Vec<Arc<Supervisor>>,
    inactive: Vec<Arc<Supervisor>>,
    /// Admitted starts that are not registered yet.
    reserved: u32,
}

impl Lists {
    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<Arc<Supervisor>> {
        match kind {
            ListKind::Active => &mut self.active,
            ListKind::Inactive => &mut self.inactive,
        }
    }

    fn contains_pid(&self, pid: u32) -> bool {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .any(|s| s.pid() == pid)
    }

    fn free_pid(&self, requested: u32) -> Option<u32> {
        let occupied = self.active.len() + self.inactive.len();
        next_free_pid(requested, occupied, |pid| self.contains_pid(pid))
    }

    fn contains(&self, supervisor: &Arc<Supervisor>) -> bool {
        self.active
            .iter()
            .chain(self.inactive.iter())
            .any(|s| Arc::ptr_eq(s, supervisor))
    }
}

struct RegistryInner {
    max_processes: u32,
    lists: Mutex<Lists>,
}

/// Shared handle to the process registry.
///
/// Clones share the same lists. Each clone carries its own slot for the
/// supervisor returned by [`Registry::find_and_lock`].
pub struct Registry {
    inner: Arc<RegistryInner>,
    held: Option<Arc<Supervisor>>,
}

impl Clone for Registry {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            held: None,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = lock(&self.inner.lists);
        f.debug_struct("Registry")
            .field("max_processes", &self.inner.max_processes)
            .field("active", &lists.active.len())
            .field("inactive", &lists.inactive.len())
            .field("reserved", &lists.reserved)
            .finish()
    }
}

/// An admitted but not yet registered start. Dropping it frees the slot.
#[must_use]
pub struct Reservation {
    inner: Arc<RegistryInner>,
    armed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut lists = lock(&self.inner.lists);
            lists.reserved = lists.reserved.saturating_sub(1);
        }
    }
}

impl Registry {
    /// `max_processes == 0` means no limit.
    pub fn new(max_processes: u32) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                max_processes,
                lists: Mutex::new(Lists::default()),
            }),
            held: None,
        }
    }

    pub fn max_processes(&self) -> u32 {
        self.inner.max_processes
    }

    /// Whether one more process would fit the budget right now.
    pub fn admission_check(&self) -> bool {
        let lists = lock(&self.inner.lists);
        self.admits(&lists)
    }

    fn admits(&self, lists: &Lists) -> bool {
        let max = self.inner.max_processes;
        max == 0 || lists.active.len() as u64 + u64::from(lists.reserved) < u64::from(max)
    }

    /// Check admission and hold the slot in one step.
    pub fn reserve(&self) -> Option<Reservation> {
        let mut lists = lock(&self.inner.lists);
        if !self.admits(&lists) {
            debug!(
                active = lists.active.len(),
                reserved = lists.reserved,
                max = self.inner.max_processes,
                "admission denied"
            );
            return None;
        }
        lists.reserved += 1;
        Some(Reservation {
            inner: self.inner.clone(),
            armed: true,
        })
    }

    /// Turn a reservation into an active entry with a collision-free PID.
    pub fn register(
        &self,
        mut reservation: Reservation,
        supervisor: &Arc<Supervisor>,
        requested: u32,
    ) -> Result<u32, RegistryError> {
        let mut lists = lock(&self.inner.lists);
        reservation.armed = false;
        lists.reserved = lists.reserved.saturating_sub(1);

        if lists.contains(supervisor) {
            error!(pid = supervisor.pid(), "supervisor registered twice");
            debug_assert!(false, "supervisor registered twice");
            return Err(RegistryError::AlreadyRegistered {
                pid: supervisor.pid(),
            });
        }

        let pid = lists.free_pid(requested).ok_or(RegistryError::PidExhausted { requested })?;
        if pid != requested {
            debug!(requested, pid, "pid collision resolved");
        }
        supervisor.set_pid(pid);
        supervisor.set_membership(Some(ListKind::Active));
        lists.active.push(supervisor.clone());
        Ok(pid)
    }

    /// PID that `register` would hand out for `requested` right now.
    pub fn assign_pid(&self, requested: u32) -> Option<u32> {
        lock(&self.inner.lists).free_pid(requested)
    }

    /// Move `supervisor` to `target`, returning where it was before.
    pub fn move_to(&self, supervisor: &Arc<Supervisor>, target: ListKind) -> Option<ListKind> {
        let mut lists = lock(&self.inner.lists);
        Self::move_locked(&mut lists, supervisor, target)
    }

    /// Move an active supervisor to `Inactive`. Anything else is left alone,
    /// including entries already detached by shutdown.
    pub(crate) fn retire(&self, supervisor: &Arc<Supervisor>) -> bool {
        let mut lists = lock(&self.inner.lists);
        if supervisor.membership() != Some(ListKind::Active) {
            return false;
        }
        Self::move_locked(&mut lists, supervisor, ListKind::Inactive);
        true
    }

    fn move_locked(
        lists: &mut Lists,
        supervisor: &Arc<Supervisor>,
        target: ListKind,
    ) -> Option<ListKind> {
        let previous = supervisor.membership();
        if previous == Some(target) {
            error!(pid = supervisor.pid(), list = ?target, "supervisor already on target list");
            debug_assert!(false, "supervisor already on target list");
            return previous;
        }
        if let Some(from) = previous {
            let list = lists.list_mut(from);
            if let Some(index) = list.iter().position(|s| Arc::ptr_eq(s, supervisor)) {
                list.remove(index);
            }
        }
        lists.list_mut(target).push(supervisor.clone());
        supervisor.set_membership(Some(target));
        debug!(pid = supervisor.pid(), from = ?previous, to = ?target, "supervisor moved");
        previous
    }

    /// Find a supervisor by PID and return it with its lock held.
    ///
    /// Active entries always match. Inactive ones match only while their
    /// worker still takes requests.
    ///
    /// The registry lock is released before this returns; the supervisor
    /// lock is released when the handle is submitted or dropped.
    pub fn find_and_lock(&mut self, pid: u32) -> Option<LockedSupervisor<'_>> {
        let lists = lock(&self.inner.lists);
        let found = lists
            .active
            .iter()
            .chain(lists.inactive.iter())
            .find(|s| s.pid() == pid)?
            .clone();
        let supervisor = self.held.insert(found);
        let supervisor: &Arc<Supervisor> = supervisor;
        let shared = supervisor.lock_shared();
        drop(lists);
        let locked = LockedSupervisor::new(supervisor, shared);
        if supervisor.membership() == Some(ListKind::Inactive)
            && locked.state() != SupervisorState::Running
        {
            return None;
        }
        Some(locked)
    }

    /// Join and drop inactive supervisors. Entries whose worker does not
    /// finish within `max_wait` stay for a later pass, and so do entries
    /// still serving output reads.
    pub fn reap_inactive(&self, max_wait: Duration) -> usize {
        let candidates: Vec<Arc<Supervisor>> = lock(&self.inner.lists).inactive.clone();
        let mut reaped = 0;
        for supervisor in candidates {
            let pid = supervisor.pid();
            if supervisor.state() == SupervisorState::Running {
                continue;
            }
            let deadline = Instant::now() + max_wait;
            if !supervisor.wait_finished(max_wait)
                || !supervisor.join_worker(deadline.saturating_duration_since(Instant::now()))
            {
                error!(pid, wait = ?max_wait, "supervisor did not stop in time, reaping later");
                continue;
            }
            supervisor.mark_stopped();
            let mut lists = lock(&self.inner.lists);
            if let Some(index) = lists.inactive.iter().position(|s| Arc::ptr_eq(s, &supervisor)) {
                lists.inactive.remove(index);
                supervisor.set_membership(None);
                reaped += 1;
                debug!(pid, "supervisor reaped");
            }
        }
        reaped
    }

    /// Stop every supervisor and empty both lists.
    ///
    /// `max_wait` bounds the whole stop phase. Workers that ignore the stop
    /// for longer are detached and left running.
    pub fn shutdown_all(&self, max_wait: Duration) {
        let running: Vec<Arc<Supervisor>> = {
            let lists = lock(&self.inner.lists);
            lists.active.iter().chain(lists.inactive.iter()).cloned().collect()
        };
        if !running.is_empty() {
            info!(count = running.len(), "stopping supervisors");
        }
        for supervisor in &running {
            supervisor.request_stop();
        }
        let deadline = Instant::now() + max_wait;
        for supervisor in &running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !supervisor.wait_finished(remaining) {
                error!(pid = supervisor.pid(), wait = ?max_wait, "supervisor did not stop in time");
            }
        }

        let grace = deadline
            .saturating_duration_since(Instant::now())
            .max(FINAL_REAP_GRACE);
        self.reap_inactive(grace);

        let leaked = {
            let mut lists = lock(&self.inner.lists);
            let mut leaked = std::mem::take(&mut lists.active);
            leaked.append(&mut lists.inactive);
            leaked
        };
        for supervisor in &leaked {
            error!(pid = supervisor.pid(), os_pid = supervisor.os_pid(), "detaching supervisor still running at shutdown");
            supervisor.set_membership(None);
        }
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "supervisors leaked at shutdown");
        }

        let lists = lock(&self.inner.lists);
        debug_assert!(
            lists.active.is_empty() && lists.inactive.is_empty(),
            "registry lists not empty after shutdown"
        );
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.lists).active.len()
    }

    pub fn inactive_count(&self) -> usize {
        lock(&self.inner.lists).inactive.len()
    }

    pub fn active_pids(&self) -> Vec<u32> {
        lock(&self.inner.lists).active.iter().map(|s| s.pid()).collect()
    }
}

/// First PID at or after `requested` (in `PID_STEP` strides) that is not
/// taken. Zero is never handed out. Gives up after `occupied + 2` candidates,
/// which is enough to get past every taken value once.
fn next_free_pid(requested: u32, occupied: usize, is_taken: impl Fn(u32) -> bool) -> Option<u32> {
    let mut candidate = requested;
    for _ in 0..occupied + 2 {
        if candidate != 0 && !is_taken(candidate) {
            return Some(candidate);
        }
        candidate = candidate.wrapping_add(PID_STEP);
    }
    None
}
