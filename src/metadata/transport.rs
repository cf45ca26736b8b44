//! Transport to metadata servers.
//!
//! The coordinator talks to metadata servers through this trait so that
//! tests can script responses; the production implementation speaks
//! HTTP/1.1 POST with bincode bodies.

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

use super::file::MetadataFile;
use super::messages::{
    MetadataOperationResult, PartitionDiscoveryRequest, PartitionDiscoveryResponse,
};
use super::operation::MetadataOperation;

/// RPC endpoint paths.
pub const PERFORM_OPERATION_PATH: &str = "/rpc/perform_metadata_operation";
pub const CREATE_FILE_PATH: &str = "/rpc/create_metadata_file";
pub const DISCOVER_PATH: &str = "/rpc/discover_partition_metadata";

#[async_trait]
pub trait MetadataTransport: Send + Sync {
    /// Apply an operation on one metadata server. Success means the server
    /// applied it and returned the resulting file checksum.
    async fn perform_operation(
        &self,
        addr: &str,
        namespace: &str,
        table_id: &str,
        op: &MetadataOperation,
    ) -> Result<MetadataOperationResult>;

    /// Store the initial metadata file on one server.
    async fn create_file(
        &self,
        addr: &str,
        namespace: &str,
        table_id: &str,
        file: &MetadataFile,
    ) -> Result<()>;

    /// Ask one metadata server for a partition's assignment.
    async fn discover(
        &self,
        addr: &str,
        request: &PartitionDiscoveryRequest,
    ) -> Result<PartitionDiscoveryResponse>;
}

/// HTTP/1.1 transport.
#[derive(Default)]
pub struct HttpMetadataTransport;

impl HttpMetadataTransport {
    pub fn new() -> Self {
        Self
    }

    /// POST `body` to `http://{addr}{path_and_query}` and return the status
    /// and response body.
    async fn post(&self, addr: &str, path_and_query: &str, body: Vec<u8>) -> Result<(StatusCode, Bytes)> {
        let stream = TcpStream::connect(addr).await?;
        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
        // The connection task owns the socket until the exchange finishes.
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "metadata connection closed with error");
            }
        });

        let request = Request::builder()
            .method(Method::POST)
            .uri(path_and_query)
            .header(HOST, addr)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(Full::new(Bytes::from(body)))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        Ok((status, body))
    }
}

#[async_trait]
impl MetadataTransport for HttpMetadataTransport {
    async fn perform_operation(
        &self,
        addr: &str,
        namespace: &str,
        table_id: &str,
        op: &MetadataOperation,
    ) -> Result<MetadataOperationResult> {
        let path = format!(
            "{PERFORM_OPERATION_PATH}?namespace={}&table={}",
            urlencode(namespace),
            urlencode(table_id)
        );
        let (status, body) = self.post(addr, &path, op.encode()?).await?;
        if status == StatusCode::CREATED {
            MetadataOperationResult::decode(&body)
        } else {
            Err(Error::IO(String::from_utf8_lossy(&body).into_owned()))
        }
    }

    async fn create_file(
        &self,
        addr: &str,
        namespace: &str,
        table_id: &str,
        file: &MetadataFile,
    ) -> Result<()> {
        let path = format!(
            "{CREATE_FILE_PATH}?namespace={}&table={}",
            urlencode(namespace),
            urlencode(table_id)
        );
        let (status, body) = self.post(addr, &path, file.encode()?).await?;
        if status == StatusCode::CREATED {
            Ok(())
        } else {
            Err(Error::IO(String::from_utf8_lossy(&body).into_owned()))
        }
    }

    async fn discover(
        &self,
        addr: &str,
        request: &PartitionDiscoveryRequest,
    ) -> Result<PartitionDiscoveryResponse> {
        let (status, body) = self.post(addr, DISCOVER_PATH, request.encode()?).await?;
        if status == StatusCode::OK {
            PartitionDiscoveryResponse::decode(&body)
        } else {
            Err(Error::IO(String::from_utf8_lossy(&body).into_owned()))
        }
    }
}

/// Percent-encode a query parameter value.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
