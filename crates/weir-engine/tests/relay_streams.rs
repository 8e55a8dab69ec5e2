//! End-to-end plain-media scenarios against in-process upstream servers.

mod common;

use axum::Router;
use axum::http::header;
use axum::routing::get;
use common::{
    Tail, build_stack, chunked, collect_all, collect_exact, paced_body, spawn_upstream, test_data,
    wait_until,
};
use futures::future::join_all;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weir_engine::{RelayConfig, RelayError, StaticCatalog, StreamSource};

fn sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[tokio::test]
async fn single_client_receives_the_stream_byte_for_byte() {
    let data = test_data(4 * 1024 * 1024);
    let payload = data.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/chan.ts",
        get(move || {
            let payload = payload.clone();
            async move {
                (
                    [(header::CONTENT_TYPE, "video/mp2t")],
                    paced_body(
                        chunked(&payload, 64 * 1024),
                        Duration::from_millis(200),
                        Duration::from_millis(2),
                        Tail::Hang,
                    ),
                )
            }
        }),
    ))
    .await;

    let catalog = Arc::new(StaticCatalog::new());
    catalog.insert(
        "chan",
        vec![StreamSource::new(format!("{upstream}/chan.ts"), "1", "0")],
    );
    let config = RelayConfig {
        shared_buffer_size: 32,
        chunk_size: 64 * 1024,
        stream_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let (handler, registry, concurrency) = build_stack(catalog, config);

    let cancel = CancellationToken::new();
    let response = handler.serve("chan", cancel.clone()).await.unwrap();
    assert_eq!(response.status, 200);
    assert!(response.headers.get(header::CONTENT_LENGTH).is_none());

    let mut body = response.into_body_stream();
    let received = collect_exact(&mut body, data.len()).await;
    assert_eq!(sha256(&received), sha256(&data));

    assert_eq!(concurrency.status("1").0, 1);

    cancel.cancel();
    drop(body);
    assert!(
        wait_until(|| concurrency.status("1").0 == 0, Duration::from_secs(3)).await,
        "source subscription count should return to zero"
    );

    // The idle coordinator is reclaimed by the sweep.
    assert!(
        wait_until(|| registry.sweep_idle() > 0 || registry.is_empty(), Duration::from_secs(2))
            .await
    );
    assert!(registry.is_empty());
}

#[tokio::test]
async fn failover_concatenates_bytes_from_the_next_source() {
    let part_a = test_data(512 * 1024);
    let part_b: Vec<u8> = test_data(256 * 1024).iter().map(|b| b ^ 0xff).collect();

    let payload_a = part_a.clone();
    let upstream_a = spawn_upstream(Router::new().route(
        "/chan.ts",
        get(move || {
            let payload = payload_a.clone();
            async move {
                paced_body(
                    chunked(&payload, 64 * 1024),
                    Duration::from_millis(200),
                    Duration::from_millis(1),
                    Tail::Error,
                )
            }
        }),
    ))
    .await;

    let payload_b = part_b.clone();
    let upstream_b = spawn_upstream(Router::new().route(
        "/chan.ts",
        get(move || {
            let payload = payload_b.clone();
            async move {
                paced_body(
                    chunked(&payload, 64 * 1024),
                    Duration::from_millis(200),
                    Duration::from_millis(1),
                    Tail::Hang,
                )
            }
        }),
    ))
    .await;

    let catalog = Arc::new(StaticCatalog::new());
    catalog.insert(
        "chan",
        vec![
            StreamSource::new(format!("{upstream_a}/chan.ts"), "1", "0"),
            StreamSource::new(format!("{upstream_b}/chan.ts"), "2", "0"),
        ],
    );
    let config = RelayConfig {
        shared_buffer_size: 32,
        chunk_size: 64 * 1024,
        stream_timeout: Some(Duration::from_secs(1)),
        ..Default::default()
    };
    let (handler, _registry, concurrency) = build_stack(catalog, config);
    // Priorities make source A the first choice deterministically.
    concurrency.set_limits("1", 0, 10);
    concurrency.set_limits("2", 0, 5);

    let cancel = CancellationToken::new();
    let response = handler.serve("chan", cancel.clone()).await.unwrap();
    let mut body = response.into_body_stream();

    let received = collect_exact(&mut body, part_a.len() + part_b.len()).await;
    assert_eq!(&received[..part_a.len()], &part_a[..]);
    assert_eq!(&received[part_a.len()..], &part_b[..]);

    cancel.cancel();
}

#[tokio::test]
async fn twenty_clients_share_one_upstream_connection() {
    let data = test_data(2 * 1024 * 1024);
    let hits = Arc::new(AtomicUsize::new(0));

    let payload = data.clone();
    let hit_counter = Arc::clone(&hits);
    let upstream = spawn_upstream(Router::new().route(
        "/chan.ts",
        get(move || {
            let payload = payload.clone();
            let hit_counter = Arc::clone(&hit_counter);
            async move {
                hit_counter.fetch_add(1, Ordering::SeqCst);
                // Every subscriber joins during the start delay.
                paced_body(
                    chunked(&payload, 64 * 1024),
                    Duration::from_millis(400),
                    Duration::from_millis(2),
                    Tail::Hang,
                )
            }
        }),
    ))
    .await;

    let catalog = Arc::new(StaticCatalog::new());
    catalog.insert(
        "chan",
        vec![StreamSource::new(format!("{upstream}/chan.ts"), "1", "0")],
    );
    let config = RelayConfig {
        shared_buffer_size: 64,
        chunk_size: 64 * 1024,
        stream_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let (handler, _registry, concurrency) = build_stack(catalog, config);

    let cancel = CancellationToken::new();
    let expected = data.len();
    let clients = (0..20).map(|_| {
        let handler = Arc::clone(&handler);
        let cancel = cancel.clone();
        async move {
            let response = handler.serve("chan", cancel).await.unwrap();
            let mut body = response.into_body_stream();
            collect_exact(&mut body, expected).await
        }
    });
    let streams = join_all(clients).await;

    let reference = sha256(&data);
    for received in &streams {
        assert_eq!(sha256(received), reference);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1, "exactly one upstream dial");
    assert_eq!(concurrency.status("1").0, 1, "one shared subscription");

    cancel.cancel();
    assert!(
        wait_until(|| concurrency.status("1").0 == 0, Duration::from_secs(3)).await,
        "subscription count should drain to zero"
    );
}

#[tokio::test]
async fn slow_consumer_is_cut_off_without_hurting_others() {
    let chunk = 4096usize;
    let total_chunks = 200usize;
    let data = test_data(chunk * total_chunks);

    let payload = data.clone();
    let upstream = spawn_upstream(Router::new().route(
        "/chan.ts",
        get(move || {
            let payload = payload.clone();
            async move {
                paced_body(
                    chunked(&payload, chunk),
                    Duration::from_millis(300),
                    Duration::from_millis(5),
                    Tail::Hang,
                )
            }
        }),
    ))
    .await;

    let catalog = Arc::new(StaticCatalog::new());
    catalog.insert(
        "chan",
        vec![StreamSource::new(format!("{upstream}/chan.ts"), "1", "0")],
    );
    let config = RelayConfig {
        shared_buffer_size: 4,
        chunk_size: chunk,
        stream_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let (handler, _registry, _concurrency) = build_stack(catalog, config);

    let cancel = CancellationToken::new();
    let healthy = handler.serve("chan", cancel.clone()).await.unwrap();
    let stalled = handler.serve("chan", cancel.clone()).await.unwrap();

    let healthy_task = {
        let expected = data.len();
        tokio::spawn(async move {
            let mut body = healthy.into_body_stream();
            collect_exact(&mut body, expected).await
        })
    };

    // The stalled client stops polling entirely while the writer laps the
    // ring, then drains whatever is left of its connection.
    let mut stalled_body = stalled.into_body_stream();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let stalled_bytes = collect_all(&mut stalled_body).await;
    assert!(
        stalled_bytes.len() < data.len(),
        "stalled consumer should be cut off early, got {} of {}",
        stalled_bytes.len(),
        data.len()
    );

    let healthy_bytes = healthy_task.await.unwrap();
    assert_eq!(sha256(&healthy_bytes), sha256(&data));

    cancel.cancel();
}

#[tokio::test]
async fn exhausted_sources_fail_the_request() {
    // Bind then drop a listener so every dial is refused.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let catalog = Arc::new(StaticCatalog::new());
    catalog.insert(
        "chan",
        vec![
            StreamSource::new(format!("http://127.0.0.1:{port}/a"), "1", "0"),
            StreamSource::new(format!("http://127.0.0.1:{port}/b"), "2", "0"),
            StreamSource::new(format!("http://127.0.0.1:{port}/c"), "3", "0"),
        ],
    );
    let config = RelayConfig {
        max_retries: 2,
        connect_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let (handler, registry, _concurrency) = build_stack(catalog, config);

    let cancel = CancellationToken::new();
    let result = handler.serve("chan", cancel).await;
    assert!(matches!(result, Err(RelayError::SourceExhausted { .. })));

    // The coordinator created for the attempt is idle and sweepable.
    assert_eq!(registry.sweep_idle(), 1);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn missing_stream_id_reports_no_sources() {
    let catalog = Arc::new(StaticCatalog::new());
    let (handler, _registry, _concurrency) = build_stack(catalog, RelayConfig::default());

    let result = handler.serve("ghost", CancellationToken::new()).await;
    assert!(matches!(result, Err(RelayError::NoSources { .. })));
}
