//! Upstream transport abstraction.
//!
//! The engine depends on [`UpstreamTransport`] rather than `reqwest`
//! directly so tests can substitute a canned responder without opening a
//! socket. [`HttpUpstreamTransport`] is the production implementation,
//! wired to a per-account [`relay_pool::ConnectionPool`] registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay_pool::ConnectionPool;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::headers::HeaderBag;

pub struct OutboundRequest {
    pub url: String,
    pub headers: HeaderBag,
    pub body: Value,
    pub timeout: Duration,
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderBag,
    pub body: Bytes,
}

/// Streaming variant: the body arrives as a channel of raw chunks rather
/// than all at once, so the engine's [`crate::stream::StreamContext`] can
/// process it incrementally.
pub struct UpstreamStreamResponse {
    pub status: u16,
    pub headers: HeaderBag,
    pub chunks: mpsc::Receiver<Result<Bytes, RelayError>>,
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send_unary(&self, account_id: &str, request: OutboundRequest) -> Result<UpstreamResponse, RelayError>;

    async fn send_streaming(
        &self,
        account_id: &str,
        request: OutboundRequest,
    ) -> Result<UpstreamStreamResponse, RelayError>;
}

/// Production transport: one [`ConnectionPool`] per upstream account,
/// looked up by id. Decompresses gzip/deflate automatically via `reqwest`'s
/// `gzip` feature.
pub struct HttpUpstreamTransport {
    pools: HashMap<String, Arc<ConnectionPool>>,
}

impl HttpUpstreamTransport {
    pub fn new(pools: HashMap<String, Arc<ConnectionPool>>) -> Self {
        Self { pools }
    }

    /// Resolves the pool for `account_id` and hands back both a connection
    /// from it and the pool itself, so a fatal send error can be reported
    /// back to the slot that produced it.
    async fn connection_for(&self, account_id: &str) -> Result<(Arc<ConnectionPool>, reqwest::Client, u64), RelayError> {
        let pool = self
            .pools
            .get(account_id)
            .cloned()
            .ok_or_else(|| RelayError::Pool(relay_pool::PoolError::Degraded {
                account_id: account_id.to_owned(),
            }))?;
        let conn = pool.get_connection().await?;
        Ok((pool, conn.client, conn.slot_id))
    }

    fn build_request(
        client: &reqwest::Client,
        request: &OutboundRequest,
    ) -> reqwest::RequestBuilder {
        let mut builder = client.post(&request.url).timeout(request.timeout).json(&request.body);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        builder
    }
}

fn header_bag_from_response(response: &reqwest::Response) -> HeaderBag {
    HeaderBag::from_pairs(response.headers().iter().filter_map(|(name, value)| {
        value.to_str().ok().map(|v| (name.as_str().to_owned(), v.to_owned()))
    }))
}

#[async_trait]
impl UpstreamTransport for HttpUpstreamTransport {
    async fn send_unary(&self, account_id: &str, request: OutboundRequest) -> Result<UpstreamResponse, RelayError> {
        let (pool, client, slot_id) = self.connection_for(account_id).await?;
        let response = Self::build_request(&client, &request)
            .send()
            .await
            .map_err(|e| handle_transport_error(&pool, slot_id, e))?;

        let status = response.status().as_u16();
        let headers = header_bag_from_response(&response);
        let body = response
            .bytes()
            .await
            .map_err(|e| handle_transport_error(&pool, slot_id, e))?;
        Ok(UpstreamResponse { status, headers, body })
    }

    async fn send_streaming(
        &self,
        account_id: &str,
        request: OutboundRequest,
    ) -> Result<UpstreamStreamResponse, RelayError> {
        let (pool, client, slot_id) = self.connection_for(account_id).await?;
        let mut response = Self::build_request(&client, &request)
            .send()
            .await
            .map_err(|e| handle_transport_error(&pool, slot_id, e))?;

        let status = response.status().as_u16();
        let headers = header_bag_from_response(&response);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            loop {
                match response.chunk().await {
                    Ok(Some(chunk)) => {
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(e) => {
                        let _ = tx.send(Err(handle_transport_error(&pool, slot_id, e))).await;
                        return;
                    }
                }
            }
        });

        Ok(UpstreamStreamResponse { status, headers, chunks: rx })
    }
}

fn classify_transport_error(error: reqwest::Error) -> RelayError {
    if error.is_timeout() {
        RelayError::UpstreamTimeout
    } else {
        RelayError::UpstreamNetwork(error.to_string())
    }
}

/// Marks the slot that produced a fatal error unhealthy (triggering
/// `ConnectionPool`'s reconnect-with-backoff) before classifying the error
/// for the caller.
fn handle_transport_error(pool: &Arc<ConnectionPool>, slot_id: u64, error: reqwest::Error) -> RelayError {
    if ConnectionPool::is_fatal(&error) {
        pool.mark_unhealthy(slot_id, error.to_string());
    }
    classify_transport_error(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_marks_pool_slot_unhealthy() {
        let pool = Arc::new(ConnectionPool::with_size("acct-1", None, 1));
        pool.initialize().await.unwrap();

        let mut pools = HashMap::new();
        pools.insert("acct-1".to_owned(), pool.clone());
        let transport = HttpUpstreamTransport::new(pools);

        let request = OutboundRequest {
            url: "http://127.0.0.1:1/unreachable".to_owned(),
            headers: HeaderBag::new(),
            body: serde_json::json!({}),
            timeout: Duration::from_millis(200),
        };
        let err = transport.send_unary("acct-1", request).await;
        assert!(err.is_err());

        // mark_unhealthy runs synchronously inside the error path; the sole
        // slot should now be out of rotation until reconnect succeeds.
        assert!(matches!(
            pool.get_connection().await,
            Err(relay_pool::PoolError::Degraded { .. })
        ));
    }
}

#[cfg(test)]
pub mod fake {
    //! Closure-configurable fake upstream. Used by `engine::tests` and
    //! available to downstream crates' integration tests.
    use super::{OutboundRequest, RelayError, UpstreamResponse, UpstreamStreamResponse};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    pub struct FakeUpstream<F> {
        pub responder: F,
        pub call_count: AtomicUsize,
    }

    impl<F> FakeUpstream<F> {
        pub fn new(responder: F) -> Self {
            Self {
                responder,
                call_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl<F> super::UpstreamTransport for FakeUpstream<F>
    where
        F: Fn(&str, &OutboundRequest) -> Result<UpstreamResponse, RelayError> + Send + Sync,
    {
        async fn send_unary(&self, account_id: &str, request: OutboundRequest) -> Result<UpstreamResponse, RelayError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            (self.responder)(account_id, &request)
        }

        async fn send_streaming(
            &self,
            account_id: &str,
            request: OutboundRequest,
        ) -> Result<UpstreamStreamResponse, RelayError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let response = (self.responder)(account_id, &request)?;
            let (tx, rx) = mpsc::channel(8);
            let _ = tx.send(Ok(Bytes::from(response.body))).await;
            Ok(UpstreamStreamResponse {
                status: response.status,
                headers: response.headers,
                chunks: rx,
            })
        }
    }
}
