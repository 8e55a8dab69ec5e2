//! Shared fixtures: in-process upstream servers and a fully wired relay
//! stack on ephemeral ports.
#![allow(dead_code)]

use axum::Router;
use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use weir_engine::{
    ConcurrencyManager, LoadBalancer, RelayConfig, RelayError, StaticCatalog, StreamHandler,
    StreamRegistry, create_client,
};

/// How an upstream body ends.
pub enum Tail {
    /// Clean end of stream.
    End,
    /// Stay open forever without sending more (a quiet live stream).
    Hang,
    /// Abort the body mid-transfer.
    Error,
}

/// A body that waits `start` before the first chunk, then releases the rest
/// with `delay` between them. The start delay gives every test client time
/// to subscribe before bytes begin to flow, the way a live stream's
/// subscribers are all attached before the next chunk arrives.
pub fn paced_body(chunks: Vec<Bytes>, start: Duration, delay: Duration, tail: Tail) -> Body {
    let items: Vec<Result<Bytes, std::io::Error>> = chunks.into_iter().map(Ok).collect();
    let head = stream::iter(items)
        .enumerate()
        .then(move |(i, item)| async move {
            if i == 0 {
                tokio::time::sleep(start).await;
            }
            tokio::time::sleep(delay).await;
            item
        });
    match tail {
        Tail::End => Body::from_stream(head),
        Tail::Hang => Body::from_stream(head.chain(stream::pending())),
        Tail::Error => Body::from_stream(head.chain(stream::iter(vec![Err(
            std::io::Error::other("upstream connection lost"),
        )]))),
    }
}

/// Serve `router` on an ephemeral loopback port, returning the base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

/// Wire a relay stack around `catalog`.
pub fn build_stack(
    catalog: Arc<StaticCatalog>,
    config: RelayConfig,
) -> (Arc<StreamHandler>, Arc<StreamRegistry>, Arc<ConcurrencyManager>) {
    let concurrency = Arc::new(ConcurrencyManager::new());
    let balancer =
        Arc::new(LoadBalancer::new(&config, catalog, Arc::clone(&concurrency)).unwrap());
    let registry = Arc::new(StreamRegistry::new(config.shared_buffer_size));
    let client = create_client(&config).unwrap();
    let handler = Arc::new(StreamHandler::new(
        config,
        Arc::clone(&registry),
        balancer,
        client,
    ));
    (handler, registry, concurrency)
}

/// Deterministic payload bytes.
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31).wrapping_add(7)) as u8).collect()
}

/// Split a payload into equal-size chunks.
pub fn chunked(data: &[u8], chunk: usize) -> Vec<Bytes> {
    data.chunks(chunk).map(Bytes::copy_from_slice).collect()
}

/// Read from a body stream until `n` bytes have arrived (panics on stream
/// end or error before that).
pub async fn collect_exact<S>(stream: &mut S, n: usize) -> Vec<u8>
where
    S: futures::Stream<Item = Result<Bytes, RelayError>> + Unpin,
{
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        match stream.next().await {
            Some(Ok(bytes)) => out.extend_from_slice(&bytes),
            Some(Err(e)) => panic!("stream error after {} bytes: {e}", out.len()),
            None => panic!("stream ended after {} of {n} bytes", out.len()),
        }
    }
    out.truncate(n);
    out
}

/// Drain a body stream to its end.
pub async fn collect_all<S>(stream: &mut S) -> Vec<u8>
where
    S: futures::Stream<Item = Result<Bytes, RelayError>> + Unpin,
{
    let mut out = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(bytes) => out.extend_from_slice(&bytes),
            Err(e) => panic!("stream error after {} bytes: {e}", out.len()),
        }
    }
    out
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
