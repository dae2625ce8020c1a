use std::collections::BTreeMap;

use log::debug;

const LOG_TAG: &str = "PrimaryLease";

/// How often the primary refreshes its lease and every client its metadata.
pub const LEASE_REFRESH_INTERVAL_MS: i64 = 4_000;

/// A lease older than this may be taken over by another client.
pub const MAX_PRIMARY_ELIGIBLE_AGE_MS: i64 = 5_000;

/// Client metadata rows not refreshed within this window are pruned.
pub const MAX_CLIENT_AGE_MS: i64 = 18 * 60 * 1_000;

/// Owner row of the shared storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimaryLease {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
}

/// Per-client row refreshed alongside the lease.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

/// Lease and client rows of a storage.
#[derive(Clone, Debug, Default)]
pub struct LeaseTable {
    owner: Option<PrimaryLease>,
    clients: BTreeMap<String, ClientMetadata>,
}

impl LeaseTable {
    pub fn owner(&self) -> Option<&PrimaryLease> {
        self.owner.as_ref()
    }

    pub fn is_owner(&self, client_id: &str) -> bool {
        self.owner
            .as_ref()
            .map(|lease| lease.owner_id == client_id)
            .unwrap_or(false)
    }

    /// Takes or extends the lease. Succeeds when nobody owns it, the caller
    /// already owns it, or the current owner stopped refreshing it.
    pub fn try_acquire_or_extend(&mut self, client_id: &str, now_ms: i64) -> bool {
        let can_acquire = match &self.owner {
            None => true,
            Some(lease) if lease.owner_id == client_id => true,
            Some(lease) => {
                let expired = now_ms - lease.lease_timestamp_ms > MAX_PRIMARY_ELIGIBLE_AGE_MS;
                // A lease from the future means a skewed clock; treat it as
                // stale too.
                let from_future = lease.lease_timestamp_ms > now_ms + MAX_PRIMARY_ELIGIBLE_AGE_MS;
                if expired || from_future {
                    debug!(
                        "[{LOG_TAG}] Client {client_id} takes over lease held by {}",
                        lease.owner_id
                    );
                }
                expired || from_future
            }
        };
        if can_acquire {
            self.owner = Some(PrimaryLease {
                owner_id: client_id.to_string(),
                lease_timestamp_ms: now_ms,
            });
        }
        can_acquire
    }

    pub fn release_lease(&mut self, client_id: &str) {
        if self.is_owner(client_id) {
            debug!("[{LOG_TAG}] Client {client_id} releases primary lease");
            self.owner = None;
        }
    }

    pub fn update_client_metadata(&mut self, metadata: ClientMetadata) {
        self.clients.insert(metadata.client_id.clone(), metadata);
    }

    pub fn remove_client(&mut self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn client_metadata(&self, client_id: &str) -> Option<&ClientMetadata> {
        self.clients.get(client_id)
    }

    pub fn active_clients(&self, now_ms: i64) -> Vec<&ClientMetadata> {
        self.clients
            .values()
            .filter(|client| now_ms - client.update_time_ms <= MAX_CLIENT_AGE_MS)
            .collect()
    }

    /// Drops rows of clients that stopped refreshing and returns their ids.
    pub fn prune_inactive_clients(&mut self, now_ms: i64) -> Vec<String> {
        let stale: Vec<String> = self
            .clients
            .values()
            .filter(|client| now_ms - client.update_time_ms > MAX_CLIENT_AGE_MS)
            .map(|client| client.client_id.clone())
            .collect();
        for client_id in &stale {
            self.clients.remove(client_id);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_moves_only_after_expiry() {
        let mut table = LeaseTable::default();
        assert!(table.try_acquire_or_extend("a", 1_000));
        assert!(!table.try_acquire_or_extend("b", 2_000));
        assert!(table.try_acquire_or_extend("a", 4_000));
        assert!(!table.try_acquire_or_extend("b", 8_000));
        assert!(table.try_acquire_or_extend("b", 4_000 + MAX_PRIMARY_ELIGIBLE_AGE_MS + 1));
        assert!(table.is_owner("b"));
    }

    #[test]
    fn release_only_affects_owner() {
        let mut table = LeaseTable::default();
        table.try_acquire_or_extend("a", 0);
        table.release_lease("b");
        assert!(table.is_owner("a"));
        table.release_lease("a");
        assert!(table.owner().is_none());
    }

    #[test]
    fn prunes_stale_clients() {
        let mut table = LeaseTable::default();
        table.update_client_metadata(ClientMetadata {
            client_id: "old".into(),
            update_time_ms: 0,
            network_enabled: true,
            in_foreground: false,
        });
        table.update_client_metadata(ClientMetadata {
            client_id: "fresh".into(),
            update_time_ms: MAX_CLIENT_AGE_MS,
            network_enabled: true,
            in_foreground: true,
        });
        let pruned = table.prune_inactive_clients(MAX_CLIENT_AGE_MS + 1);
        assert_eq!(pruned, vec!["old".to_string()]);
        assert!(table.client_metadata("fresh").is_some());
    }
}
