//! redb table definitions for the local backend.

use redb::TableDefinition;

/// Pod manifests, keyed by `<tree>/<node>/<pod-id>`. Values are the raw
/// manifest YAML bytes.
pub(crate) const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

/// Label sets, keyed by `<label-type>/<id>`. Values are JSON maps.
pub(crate) const LABELS: TableDefinition<&str, &[u8]> = TableDefinition::new("labels");

/// Lock entries, keyed by lock path. Values are JSON `LockEntry` records.
pub(crate) const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");

/// Sessions, keyed by session id. Values are the session names.
pub(crate) const SESSIONS: TableDefinition<&str, &str> = TableDefinition::new("sessions");
