use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per fleet. Holding the guard serialises every fleet
/// manager operation on that fleet while leaving other fleets untouched.
#[derive(Default)]
pub struct FleetLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl FleetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, fleet_id: Uuid) -> Arc<Mutex<()>> {
        // Clone out of the map so no shard lock is held across an await.
        self.locks
            .entry(fleet_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn lock(&self, fleet_id: Uuid) -> OwnedMutexGuard<()> {
        self.entry(fleet_id).lock_owned().await
    }

    /// `None` when another operation holds the fleet.
    pub fn try_lock(&self, fleet_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.entry(fleet_id).try_lock_owned().ok()
    }

    /// Drops the entry of a fleet nobody is waiting on.
    pub fn forget(&self, fleet_id: Uuid) {
        self.locks
            .remove_if(&fleet_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
