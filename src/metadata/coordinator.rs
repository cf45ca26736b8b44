//! Quorum commit of metadata operations.

use std::collections::HashSet;
use std::sync::Arc;

use crate::directory::{ConfigDirectory, ServerStatus};
use crate::error::{Error, Result};

use super::file::MetadataFile;
use super::messages::{MetadataOperationResult, PartitionDiscoveryRequest, PartitionDiscoveryResponse};
use super::operation::MetadataOperation;
use super::transport::MetadataTransport;

/// Applies metadata operations across a table's metadata-server set.
///
/// An operation commits when a majority of servers applied it and every
/// successful application produced the same metadata file checksum. The
/// second condition is the stronger one: a quorum of servers that disagree
/// on the file contents must never advance the table's txn cursor.
pub struct MetadataCoordinator {
    directory: Arc<dyn ConfigDirectory>,
    transport: Arc<dyn MetadataTransport>,
}

impl MetadataCoordinator {
    pub fn new(
        directory: Arc<dyn ConfigDirectory>,
        transport: Arc<dyn MetadataTransport>,
    ) -> Self {
        Self {
            directory,
            transport,
        }
    }

    /// Apply `op` across the table's metadata servers and, on success,
    /// advance the table's metadata txn cursor in the directory.
    pub async fn perform_and_commit_operation(
        &self,
        namespace: &str,
        table_id: &str,
        op: MetadataOperation,
    ) -> Result<()> {
        let mut table_config = self.directory.get_table_config(namespace, table_id)?;
        if table_config.metadata_txnid != op.input_txnid {
            return Err(Error::ConcurrentModification(
                "operation prepared against a stale metadata transaction".to_string(),
            ));
        }

        let servers = table_config.metadata_servers.clone();
        self.perform_operation(namespace, table_id, &op, &servers)
            .await?;

        table_config.metadata_txnid = op.output_txnid;
        table_config.metadata_txnseq += 1;
        self.directory.update_table_config(table_config)?;
        Ok(())
    }

    /// Broadcast `op` and evaluate divergence and quorum. Does not touch the
    /// table config.
    async fn perform_operation(
        &self,
        namespace: &str,
        table_id: &str,
        op: &MetadataOperation,
        servers: &[String],
    ) -> Result<()> {
        if servers.is_empty() {
            return Err(Error::InvalidInput("server list can't be empty".to_string()));
        }

        let mut failures = 0usize;
        let mut checksums: HashSet<u64> = HashSet::new();
        for server in servers {
            match self.perform_on_server(namespace, table_id, op, server).await {
                Ok(result) => {
                    checksums.insert(result.metadata_file_checksum);
                }
                Err(e) => {
                    tracing::debug!(
                        server = %server,
                        error = %e,
                        "error while performing metadata operation"
                    );
                    failures += 1;
                }
            }
        }

        if checksums.len() > 1 {
            return Err(Error::Runtime(
                "metadata operation would corrupt file".to_string(),
            ));
        }

        if failures <= max_failures(servers.len()) {
            Ok(())
        } else {
            Err(Error::Runtime(
                "error while performing metadata operation".to_string(),
            ))
        }
    }

    async fn perform_on_server(
        &self,
        namespace: &str,
        table_id: &str,
        op: &MetadataOperation,
        server: &str,
    ) -> Result<MetadataOperationResult> {
        let server_config = self.directory.get_server_config(server)?;
        if server_config.addr.is_empty() {
            return Err(Error::Runtime(format!("server {server} is offline")));
        }

        tracing::debug!(
            namespace = %namespace,
            table = %table_id,
            input_txnid = %op.input_txnid,
            output_txnid = %op.output_txnid,
            server = %server,
            addr = %server_config.addr,
            "performing metadata operation"
        );

        self.transport
            .perform_operation(&server_config.addr, namespace, table_id, op)
            .await
    }

    /// Store the initial metadata file on `servers` under the same quorum
    /// rule. There is no divergence check: the file is the initial state,
    /// not a transition.
    pub async fn create_file(
        &self,
        namespace: &str,
        table_id: &str,
        file: &MetadataFile,
        servers: &[String],
    ) -> Result<()> {
        if servers.is_empty() {
            return Err(Error::InvalidInput("server list can't be empty".to_string()));
        }

        let mut failures = 0usize;
        for server in servers {
            let result = match self.directory.get_server_config(server) {
                Ok(config) if !config.addr.is_empty() => {
                    self.transport
                        .create_file(&config.addr, namespace, table_id, file)
                        .await
                }
                Ok(_) => Err(Error::Runtime(format!("server {server} is offline"))),
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::debug!(server = %server, error = %e, "error while creating metadata file");
                failures += 1;
            }
        }

        if failures <= max_failures(servers.len()) {
            Ok(())
        } else {
            Err(Error::Runtime(
                "error while creating metadata file".to_string(),
            ))
        }
    }

    /// Fetch a partition's current assignment from the first metadata server
    /// able to answer.
    pub async fn discover_partition(
        &self,
        request: PartitionDiscoveryRequest,
    ) -> Result<PartitionDiscoveryResponse> {
        let table_config = self
            .directory
            .get_table_config(&request.namespace, &request.table_id)?;

        if table_config.metadata_txnseq < request.min_txnseq {
            return Err(Error::ConcurrentModification(format!(
                "no metadata server has txnseq >= {}",
                request.min_txnseq
            )));
        }

        let mut request = request;
        request.requester_id = self.directory.get_server_id();

        for server in &table_config.metadata_servers {
            let Ok(server_config) = self.directory.get_server_config(server) else {
                continue;
            };
            if server_config.status != ServerStatus::Up {
                continue;
            }

            match self.transport.discover(&server_config.addr, &request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::debug!(server = %server, error = %e, "metadata discovery failed");
                }
            }
        }

        Err(Error::IO(
            "no metadata server has the requested transaction".to_string(),
        ))
    }
}

/// Failures tolerated for `n` servers: a minority, and none for a single
/// server.
fn max_failures(n: usize) -> usize {
    if n > 1 {
        (n - 1) / 2
    } else {
        0
    }
}
