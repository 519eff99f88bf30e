//! Persisted lease records and bulk reconciliation.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

use crate::error::Result;
use crate::notify::ZoneChangeNotifier;
use kindling_common::strip_domain;

/// Store of IP/MAC lease records, plus the node identity data needed to
/// resolve hostnames to leased addresses.
///
/// Leases are never updated in place: a changed mapping is a delete
/// followed by an insert, and both halves of a reconciliation run inside
/// one transaction. The `UNIQUE (nodegroup_id, ip)` constraint makes a
/// racing reconciliation for the same segment fail with a constraint
/// violation instead of silently duplicating an address.
pub struct LeaseStore {
    pool: SqlitePool,
    notifier: Arc<dyn ZoneChangeNotifier>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nodegroup_id INTEGER NOT NULL,
    hostname TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS macs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id INTEGER NOT NULL,
    mac TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS leases (
    nodegroup_id INTEGER NOT NULL,
    ip TEXT NOT NULL,
    mac TEXT NOT NULL,
    UNIQUE (nodegroup_id, ip)
);
CREATE INDEX IF NOT EXISTS idx_leases_mac ON leases (mac);
"#;

impl LeaseStore {
    /// Open (or create) the lease database at `url` and run the schema.
    pub async fn connect(url: &str, notifier: Arc<dyn ZoneChangeNotifier>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, notifier })
    }

    /// Open an in-memory lease database.
    ///
    /// A single connection is used so that every query sees the same
    /// in-memory database.
    pub async fn in_memory(notifier: Arc<dyn ZoneChangeNotifier>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool, notifier })
    }

    /// Refresh our knowledge of a segment's IP/MAC mappings.
    ///
    /// `current` is the full snapshot of leases as managed by the
    /// segment's DHCP server, keyed by IP address. Persisted pairs not in
    /// the snapshot are deleted; snapshot pairs whose IP is not yet
    /// persisted are inserted. Both happen in one transaction.
    ///
    /// Returns the newly leased IP addresses. If there are any, the DNS
    /// zone notifier is invoked for the segment after commit; notifier
    /// failures are logged and do not fail the call.
    pub async fn update_leases(
        &self,
        nodegroup_id: i64,
        current: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        Self::delete_obsolete_leases(&mut tx, nodegroup_id, current).await?;
        let new_ips = Self::add_missing_leases(&mut tx, nodegroup_id, current).await?;
        tx.commit().await?;

        if !new_ips.is_empty() {
            debug!(
                nodegroup = nodegroup_id,
                new = new_ips.len(),
                "new leases recorded"
            );
            if let Err(error) = self.notifier.zones_changed(&[nodegroup_id]).await {
                warn!(nodegroup = nodegroup_id, %error, "DNS zone notification failed");
            }
        }
        Ok(new_ips)
    }

    /// Delete leases for `nodegroup_id` whose (ip, mac) pair is not in
    /// `current`.
    ///
    /// The predicate is tiered by snapshot size purely to keep the SQL
    /// small for the common cases; the "NOT IN" form is correct for all
    /// of them.
    async fn delete_obsolete_leases(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        nodegroup_id: i64,
        current: &BTreeMap<String, String>,
    ) -> Result<()> {
        match current.len() {
            0 => {
                sqlx::query("DELETE FROM leases WHERE nodegroup_id = ?")
                    .bind(nodegroup_id)
                    .execute(&mut **tx)
                    .await?;
            }
            1 => {
                let (ip, mac) = current
                    .iter()
                    .next()
                    .map(|(ip, mac)| (ip.as_str(), mac.as_str()))
                    .unwrap_or(("", ""));
                sqlx::query(
                    "DELETE FROM leases WHERE nodegroup_id = ? AND (ip, mac) <> (?, ?)",
                )
                .bind(nodegroup_id)
                .bind(ip)
                .bind(mac)
                .execute(&mut **tx)
                .await?;
            }
            n => {
                let placeholders = vec!["(?, ?)"; n].join(", ");
                let sql = format!(
                    "DELETE FROM leases WHERE nodegroup_id = ? \
                     AND (ip, mac) NOT IN (VALUES {placeholders})"
                );
                let mut query = sqlx::query(&sql).bind(nodegroup_id);
                for (ip, mac) in current {
                    query = query.bind(ip).bind(mac);
                }
                query.execute(&mut **tx).await?;
            }
        }
        Ok(())
    }

    /// Insert pairs from `current` whose IP is not persisted yet.
    ///
    /// Assumed to run right after `delete_obsolete_leases` in the same
    /// transaction, so a persisted IP can only carry the same MAC as the
    /// snapshot. Returns the inserted IPs.
    async fn add_missing_leases(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        nodegroup_id: i64,
        current: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT ip FROM leases WHERE nodegroup_id = ?")
            .bind(nodegroup_id)
            .fetch_all(&mut **tx)
            .await?;
        let leased: HashSet<String> = rows.iter().map(|row| row.get::<String, _>(0)).collect();

        let new_leases: Vec<(&str, &str)> = current
            .iter()
            .filter(|(ip, _)| !leased.contains(ip.as_str()))
            .map(|(ip, mac)| (ip.as_str(), mac.as_str()))
            .collect();
        if new_leases.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["(?, ?, ?)"; new_leases.len()].join(", ");
        let sql = format!("INSERT INTO leases (nodegroup_id, ip, mac) VALUES {placeholders}");
        let mut query = sqlx::query(&sql);
        for (ip, mac) in &new_leases {
            query = query.bind(nodegroup_id).bind(*ip).bind(*mac);
        }
        query.execute(&mut **tx).await?;

        Ok(new_leases.into_iter().map(|(ip, _)| ip.to_string()).collect())
    }

    /// Return a {hostname -> ip} mapping for the currently leased
    /// addresses of the nodes in `nodegroup_id`.
    ///
    /// For each node only the oldest MAC address that actually has a
    /// lease is considered; MAC age is creation order. Domains are
    /// stripped from hostnames. Nodes with no leased MAC are omitted.
    pub async fn get_hostname_ip_mapping(
        &self,
        nodegroup_id: i64,
    ) -> Result<BTreeMap<String, String>> {
        // Ordered by hostname then MAC creation order; the first row seen
        // for a hostname wins, which picks the oldest leased MAC.
        let rows = sqlx::query(
            "SELECT nodes.hostname, leases.ip \
             FROM macs \
             JOIN nodes ON nodes.id = macs.node_id \
             JOIN leases ON leases.mac = macs.mac \
             WHERE leases.nodegroup_id = ? \
             ORDER BY nodes.hostname, macs.id",
        )
        .bind(nodegroup_id)
        .fetch_all(&self.pool)
        .await?;

        let mut mapping = BTreeMap::new();
        let mut seen: HashSet<String> = HashSet::new();
        for row in rows {
            let hostname: String = row.get(0);
            let ip: String = row.get(1);
            if seen.insert(hostname.clone()) {
                mapping.insert(strip_domain(&hostname).to_string(), ip);
            }
        }
        Ok(mapping)
    }

    /// Delete all leases held by `mac`, across segments.
    ///
    /// Invoked when a MAC address record is removed from the system, so
    /// that stale mappings don't linger. Returns the number of leases
    /// deleted.
    pub async fn delete_leases_for_mac(&self, mac: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM leases WHERE mac = ?")
            .bind(mac)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Register a node in a segment. Returns the node id.
    pub async fn add_node(&self, nodegroup_id: i64, hostname: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO nodes (nodegroup_id, hostname) VALUES (?, ?)")
            .bind(nodegroup_id)
            .bind(hostname)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Register a MAC address belonging to a node. Creation order defines
    /// MAC age for hostname resolution. Returns the MAC record id.
    pub async fn add_mac(&self, node_id: i64, mac: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO macs (node_id, mac) VALUES (?, ?)")
            .bind(node_id)
            .bind(mac)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Return all (ip, mac) pairs persisted for a segment.
    pub async fn leases_for(&self, nodegroup_id: i64) -> Result<BTreeMap<String, String>> {
        let rows = sqlx::query("SELECT ip, mac FROM leases WHERE nodegroup_id = ?")
            .bind(nodegroup_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect())
    }
}

impl std::fmt::Debug for LeaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NoopNotifier;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every notification for assertions.
    struct RecordingNotifier {
        calls: Mutex<Vec<Vec<i64>>>,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<i64>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ZoneChangeNotifier for RecordingNotifier {
        async fn zones_changed(&self, nodegroups: &[i64]) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(nodegroups.to_vec());
            Ok(())
        }
    }

    fn leases(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(ip, mac)| (ip.to_string(), mac.to_string()))
            .collect()
    }

    async fn store() -> LeaseStore {
        LeaseStore::in_memory(Arc::new(NoopNotifier)).await.unwrap()
    }

    #[tokio::test]
    async fn test_update_leases_inserts_new() {
        let store = store().await;
        let snapshot = leases(&[
            ("10.0.0.10", "aa:bb:cc:dd:ee:01"),
            ("10.0.0.11", "aa:bb:cc:dd:ee:02"),
        ]);

        let mut new_ips = store.update_leases(1, &snapshot).await.unwrap();
        new_ips.sort();
        assert_eq!(new_ips, vec!["10.0.0.10", "10.0.0.11"]);
        assert_eq!(store.leases_for(1).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_update_leases_is_idempotent() {
        let store = store().await;
        let snapshot = leases(&[
            ("10.0.0.10", "aa:bb:cc:dd:ee:01"),
            ("10.0.0.11", "aa:bb:cc:dd:ee:02"),
        ]);

        store.update_leases(1, &snapshot).await.unwrap();
        let second = store.update_leases(1, &snapshot).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(store.leases_for(1).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_update_leases_empty_snapshot_clears_segment() {
        let store = store().await;
        let snapshot = leases(&[("10.0.0.10", "aa:bb:cc:dd:ee:01")]);
        store.update_leases(1, &snapshot).await.unwrap();

        let new_ips = store.update_leases(1, &BTreeMap::new()).await.unwrap();
        assert!(new_ips.is_empty());
        assert!(store.leases_for(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_leases_reassigns_mac() {
        let store = store().await;
        store
            .update_leases(1, &leases(&[("10.0.0.10", "aa:bb:cc:dd:ee:01")]))
            .await
            .unwrap();

        // Same IP handed to a different MAC: old pair deleted, new pair
        // inserted, single row for the IP.
        let reassigned = leases(&[("10.0.0.10", "aa:bb:cc:dd:ee:02")]);
        let new_ips = store.update_leases(1, &reassigned).await.unwrap();
        assert_eq!(new_ips, vec!["10.0.0.10"]);
        assert_eq!(store.leases_for(1).await.unwrap(), reassigned);
    }

    #[tokio::test]
    async fn test_update_leases_single_entry_snapshot() {
        // Exercises the "(ip, mac) <> (?, ?)" single-pair predicate tier.
        let store = store().await;
        store
            .update_leases(
                1,
                &leases(&[
                    ("10.0.0.10", "aa:bb:cc:dd:ee:01"),
                    ("10.0.0.11", "aa:bb:cc:dd:ee:02"),
                ]),
            )
            .await
            .unwrap();

        let snapshot = leases(&[("10.0.0.11", "aa:bb:cc:dd:ee:02")]);
        let new_ips = store.update_leases(1, &snapshot).await.unwrap();
        assert!(new_ips.is_empty());
        assert_eq!(store.leases_for(1).await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn test_update_leases_does_not_touch_other_segments() {
        let store = store().await;
        store
            .update_leases(1, &leases(&[("10.0.0.10", "aa:bb:cc:dd:ee:01")]))
            .await
            .unwrap();
        store
            .update_leases(2, &leases(&[("10.1.0.10", "aa:bb:cc:dd:ee:02")]))
            .await
            .unwrap();

        store.update_leases(1, &BTreeMap::new()).await.unwrap();
        assert_eq!(
            store.leases_for(2).await.unwrap(),
            leases(&[("10.1.0.10", "aa:bb:cc:dd:ee:02")])
        );
    }

    #[tokio::test]
    async fn test_notifier_called_only_for_new_leases() {
        let notifier = Arc::new(RecordingNotifier::new());
        let store = LeaseStore::in_memory(notifier.clone()).await.unwrap();
        let snapshot = leases(&[("10.0.0.10", "aa:bb:cc:dd:ee:01")]);

        store.update_leases(7, &snapshot).await.unwrap();
        assert_eq!(notifier.calls(), vec![vec![7]]);

        // No change: no notification.
        store.update_leases(7, &snapshot).await.unwrap();
        assert_eq!(notifier.calls(), vec![vec![7]]);

        // Deletions alone don't regenerate zones either.
        store.update_leases(7, &BTreeMap::new()).await.unwrap();
        assert_eq!(notifier.calls(), vec![vec![7]]);
    }

    #[tokio::test]
    async fn test_hostname_mapping_prefers_oldest_leased_mac() {
        let store = store().await;
        let node = store.add_node(1, "node01.example.com").await.unwrap();
        store.add_mac(node, "aa:bb:cc:dd:ee:01").await.unwrap();
        store.add_mac(node, "aa:bb:cc:dd:ee:02").await.unwrap();

        // Both MACs leased: the older MAC's lease wins.
        store
            .update_leases(
                1,
                &leases(&[
                    ("10.0.0.10", "aa:bb:cc:dd:ee:01"),
                    ("10.0.0.11", "aa:bb:cc:dd:ee:02"),
                ]),
            )
            .await
            .unwrap();
        let mapping = store.get_hostname_ip_mapping(1).await.unwrap();
        assert_eq!(mapping.get("node01"), Some(&"10.0.0.10".to_string()));
    }

    #[tokio::test]
    async fn test_hostname_mapping_falls_back_to_leased_mac() {
        let store = store().await;
        let node = store.add_node(1, "node01.example.com").await.unwrap();
        store.add_mac(node, "aa:bb:cc:dd:ee:01").await.unwrap();
        store.add_mac(node, "aa:bb:cc:dd:ee:02").await.unwrap();

        // Only the newer MAC has a lease; its lease is used even though
        // an older MAC exists.
        store
            .update_leases(1, &leases(&[("10.0.0.11", "aa:bb:cc:dd:ee:02")]))
            .await
            .unwrap();
        let mapping = store.get_hostname_ip_mapping(1).await.unwrap();
        assert_eq!(mapping.get("node01"), Some(&"10.0.0.11".to_string()));
    }

    #[tokio::test]
    async fn test_hostname_mapping_omits_unleased_nodes() {
        let store = store().await;
        let node = store.add_node(1, "node02.example.com").await.unwrap();
        store.add_mac(node, "aa:bb:cc:dd:ee:03").await.unwrap();

        let mapping = store.get_hostname_ip_mapping(1).await.unwrap();
        assert!(mapping.is_empty());
    }

    #[tokio::test]
    async fn test_delete_leases_for_mac() {
        let store = store().await;
        store
            .update_leases(
                1,
                &leases(&[
                    ("10.0.0.10", "aa:bb:cc:dd:ee:01"),
                    ("10.0.0.11", "aa:bb:cc:dd:ee:01"),
                    ("10.0.0.12", "aa:bb:cc:dd:ee:02"),
                ]),
            )
            .await
            .unwrap();

        let deleted = store.delete_leases_for_mac("aa:bb:cc:dd:ee:01").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(
            store.leases_for(1).await.unwrap(),
            leases(&[("10.0.0.12", "aa:bb:cc:dd:ee:02")])
        );
    }
}
