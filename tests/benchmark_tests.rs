//! Performance benchmarks for the proxy's hot paths

use bytes::Bytes;
use protocol::ack::compress;
use protocol::mcpe::{self, Batch};
use protocol::{AckPacket, ReliableLink};
use proxy::registry::{ConnectionRegistry, SessionHandle};
use proxy::rewriter::EntityIdRewriter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Benchmarks cutting payloads into datagrams
#[test]
fn benchmark_fragmentation() {
    let link = ReliableLink::new(1400);
    let mut rng = StdRng::seed_from_u64(1);
    let payload = Bytes::from(vec![7u8; 8000]);

    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let datagrams = link.fragment(payload.clone(), &mut rng).unwrap();
        assert!(datagrams.len() > 1);
    }

    let duration = start.elapsed();
    println!(
        "Fragmentation: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // Should complete in under 2s for 10k 8 KB payloads
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks split reassembly of the same payloads
#[test]
fn benchmark_reassembly() {
    let sender = ReliableLink::new(1400);
    let receiver = ReliableLink::new(1400);
    let mut rng = StdRng::seed_from_u64(2);
    let payload = Bytes::from(vec![9u8; 8000]);

    let encoded: Vec<Vec<Bytes>> = (0..2_000)
        .map(|_| {
            sender
                .fragment(payload.clone(), &mut rng)
                .unwrap()
                .iter()
                .map(|d| d.encode())
                .collect()
        })
        .collect();

    let start = Instant::now();
    let mut completed = 0;
    for datagrams in &encoded {
        for datagram in datagrams {
            completed += receiver.receive(datagram).unwrap().len();
        }
    }
    let duration = start.elapsed();

    println!(
        "Reassembly: {} messages in {:?} ({:.2} μs/message)",
        completed,
        duration,
        duration.as_micros() as f64 / completed as f64
    );

    assert_eq!(completed, encoded.len());
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks ACK compression over a mostly contiguous window
#[test]
fn benchmark_ack_compression() {
    let sequences: Vec<u32> = (0..10_000u32).filter(|s| s % 97 != 0).collect();

    let iterations = 1_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let packet = AckPacket::ack(compress(&sequences));
        let encoded = packet.encode();
        assert!(!encoded.is_empty());
    }

    let duration = start.elapsed();
    println!(
        "ACK compression: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Benchmarks entity id rewriting inside compressed batches
#[test]
fn benchmark_batch_rewriting() {
    let mut rewriter = EntityIdRewriter::new(7);
    rewriter.set_new_server_id(99);

    let packets: Vec<Bytes> = (0..32)
        .map(|i| {
            let mut packet = vec![mcpe::ID_MOVE_PLAYER];
            let entity: i64 = if i % 2 == 0 { 99 } else { i };
            packet.extend_from_slice(&entity.to_be_bytes());
            packet.extend_from_slice(&[0u8; 24]);
            Bytes::from(packet)
        })
        .collect();
    let batch = Batch::new(packets).encode().unwrap();

    let iterations = 2_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let rewritten = rewriter.rewrite_client_bound(batch.clone());
        assert_ne!(rewritten, batch);
    }

    let duration = start.elapsed();
    println!(
        "Batch rewriting: {} iterations in {:?} ({:.2} μs/iter)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 3000);
}

/// Stress test for endpoint lookups with many registered sessions
#[test]
fn stress_test_registry_lookups() {
    let registry = ConnectionRegistry::new();
    let sessions = 5_000u16;

    tokio_test::block_on(async {
        for port in 0..sessions {
            let (inbound, _) = mpsc::channel(1);
            let (events, _) = mpsc::unbounded_channel();
            let endpoint = SocketAddr::from(([10, 0, 0, 1], 20_000 + port));
            let handle = SessionHandle::new(
                registry.allocate_id(),
                endpoint,
                inbound,
                events,
                CancellationToken::new(),
            );
            assert!(registry.register(handle).await);
        }

        let start = Instant::now();
        for port in 0..sessions {
            let endpoint = SocketAddr::from(([10, 0, 0, 1], 20_000 + port));
            assert!(registry.get_by_endpoint(endpoint).await.is_some());
        }
        let duration = start.elapsed();

        println!("Registry: {} lookups in {:?}", sessions, duration);
        assert!(duration.as_millis() < 1000);
    });
}
