//! DNS zone change notification.
//!
//! The DNS component regenerates zone files when lease state changes.
//! From the reconciler's point of view this is fire-and-forget: a failed
//! notification is logged, never rolled back into the lease transaction.

use async_trait::async_trait;

/// Collaborator notified when segments gain newly leased addresses.
#[async_trait]
pub trait ZoneChangeNotifier: Send + Sync {
    /// Signal that the DNS zones for `nodegroups` need regenerating.
    async fn zones_changed(&self, nodegroups: &[i64]) -> anyhow::Result<()>;
}

/// Notifier that does nothing.
///
/// Used when DNS is managed externally, and in tests that don't care
/// about zone regeneration.
pub struct NoopNotifier;

#[async_trait]
impl ZoneChangeNotifier for NoopNotifier {
    async fn zones_changed(&self, _nodegroups: &[i64]) -> anyhow::Result<()> {
        Ok(())
    }
}
