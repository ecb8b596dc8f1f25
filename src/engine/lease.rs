use ulid::Ulid;

use crate::model::{Event, Lease, Ms};

use super::{Engine, EngineError};

/// A lease not renewed within this window is up for grabs.
pub const LEASE_STALE_MS: Ms = 30_000;

impl Lease {
    pub fn is_stale(&self, now: Ms) -> bool {
        now - self.renewed_at > LEASE_STALE_MS
    }
}

fn lease_is_open(lease: &Lease, instance_id: &str, now: Ms) -> bool {
    lease.holder == instance_id || lease.is_stale(now)
}

impl Engine {
    /// True when nobody holds the business lease, it went stale, or `instance_id` holds it.
    pub fn is_leader(&self, business_id: Ulid, instance_id: &str) -> bool {
        let now = self.now_ms();
        self.store
            .lease(&business_id)
            .is_none_or(|lease| lease_is_open(&lease, instance_id, now))
    }

    /// Unconditional write, persisted so a restart or a second instance
    /// talking to this server sees the same holder.
    pub async fn renew_lease(&self, business_id: Ulid, instance_id: &str) -> Result<(), EngineError> {
        self.business_record(&business_id)?;
        if instance_id.is_empty() {
            return Err(EngineError::InvalidInput("lease holder must not be empty"));
        }
        let event = Event::LeaseRenewed {
            business_id,
            holder: instance_id.to_string(),
            renewed_at: self.now_ms(),
        };
        let _gate = self.persist_gate.read().await;
        self.wal_append(&event).await?;
        self.store.apply(&event);
        Ok(())
    }

    /// Check and renew as one step. Returns whether `instance_id` now holds the lease.
    pub async fn try_acquire_lease(&self, business_id: Ulid, instance_id: &str) -> Result<bool, EngineError> {
        let _serial = self.lease_gate.lock().await;
        let previous = self.store.lease(&business_id);
        if !self.is_leader(business_id, instance_id) {
            return Ok(false);
        }
        self.renew_lease(business_id, instance_id).await?;
        if let Some(previous) = previous.filter(|l| l.holder != instance_id) {
            tracing::info!(business = %business_id, from = %previous.holder, to = instance_id, "lease taken over");
        }
        Ok(true)
    }

    pub fn lease_holder(&self, business_id: &Ulid) -> Option<Lease> {
        self.store.lease(business_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_when_own_or_stale() {
        let lease = Lease { holder: "a".into(), renewed_at: 100_000 };
        assert!(lease_is_open(&lease, "a", 100_000));
        assert!(!lease_is_open(&lease, "b", 100_000 + LEASE_STALE_MS));
        assert!(lease_is_open(&lease, "b", 100_001 + LEASE_STALE_MS));
    }
}
