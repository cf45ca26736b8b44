//! Thin table handle.
//!
//! The partition writer needs the table's schema-level facts (partition key
//! column, keyspace type) but must not hold a back-reference into a table
//! registry. `TableHandle` is the value-typed slice of a table definition
//! the storage layer consumes; mutable table state (metadata txn cursor,
//! thresholds) lives in [`crate::directory::TableConfig`] and is fetched
//! from the directory when needed.

use std::sync::Arc;

use crate::keys::KeyspaceType;

#[derive(Clone, Debug)]
pub struct TableHandle {
    namespace: String,
    table_id: String,
    partition_key: String,
    keyspace: KeyspaceType,
}

impl TableHandle {
    pub fn new(
        namespace: impl Into<String>,
        table_id: impl Into<String>,
        partition_key: impl Into<String>,
        keyspace: KeyspaceType,
    ) -> Arc<Self> {
        Arc::new(Self {
            namespace: namespace.into(),
            table_id: table_id.into(),
            partition_key: partition_key.into(),
            keyspace,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn table_id(&self) -> &str {
        &self.table_id
    }

    /// Name of the column the table partitions over.
    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn keyspace(&self) -> KeyspaceType {
        self.keyspace
    }
}
