// Entity Models - snapshots, links and registered versions
//
// - EntitySnapshot: one source system's view of one thing (the unit of ingest)
// - Link / LinkPointer: synonym and relationship links between snapshots
// - RegisteredEntityVersion: time-bounded merge of every snapshot currently
//   agreed to describe the same real-world thing

pub mod link;
pub mod snapshot;
pub mod version;

pub use link::{EntityLink, Link, LinkPointer, SYNONYM};
pub use snapshot::{EntityKey, EntitySnapshot};
pub use version::RegisteredEntityVersion;
