//! DHCP lease reconciliation.
//!
//! DHCP workers periodically report a full snapshot of the IP/MAC mappings
//! they have handed out on a network segment. This crate reconciles those
//! snapshots against persisted lease records: obsolete pairs are deleted,
//! new ones inserted, both in a single transaction, and DNS zone
//! regeneration is triggered when new addresses appear.
//!
//! This is expected to be a busy part of the database, so reconciliation
//! works in bulk rather than row by row.

pub mod error;
pub mod notify;
pub mod store;

pub use error::{LeaseError, Result};
pub use notify::{NoopNotifier, ZoneChangeNotifier};
pub use store::LeaseStore;
