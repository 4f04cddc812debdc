//! Property tests: no interleaving of store, discard and sweep loses a chunk
//! that a live manifest references.

use std::sync::Arc;

use proptest::prelude::*;
use tessera_integration_tests::{Deployment, assert_roundtrip, fixed_config};
use tessera_types::Manifest;

/// Four-byte blocks the payloads are built from, so payloads share chunks.
const BLOCKS: [&[u8; 4]; 5] = [b"AAAA", b"BBBB", b"CCCC", b"DDDD", b"EEEE"];

#[derive(Debug, Clone)]
enum Op {
    /// Store a payload built from these block indices, via this instance.
    Store(Vec<usize>, usize),
    /// Discard the n-th live manifest (modulo the live count).
    Discard(usize),
    /// Sweep one batch of this size.
    Sweep(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (prop::collection::vec(0..BLOCKS.len(), 0..6), 0..2usize)
            .prop_map(|(blocks, at)| Op::Store(blocks, at)),
        3 => any::<usize>().prop_map(Op::Discard),
        2 => (1..8usize).prop_map(Op::Sweep),
    ]
}

fn payload(blocks: &[usize]) -> Vec<u8> {
    blocks.iter().flat_map(|&i| BLOCKS[i].iter().copied()).collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Sequential interleavings against a model of the live manifests.
    #[test]
    fn sequential_ops_preserve_reference_invariant(
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        runtime().block_on(async {
            let d = Deployment::new(2, fixed_config(4));
            let mut live: Vec<(Manifest, Vec<u8>)> = Vec::new();

            for op in ops {
                match op {
                    Op::Store(blocks, at) => {
                        let data = payload(&blocks);
                        let manifest = d.engine(at).store(&data).await.unwrap();
                        live.push((manifest, data));
                    }
                    Op::Discard(n) => {
                        if live.is_empty() {
                            continue;
                        }
                        let (manifest, _) = live.remove(n % live.len());
                        d.engine(n % 2).discard(manifest.id).await.unwrap();
                    }
                    Op::Sweep(batch) => {
                        d.engine(1).sweep(batch).await.unwrap();
                        for (manifest, data) in &live {
                            assert_roundtrip(d.engine(0), manifest, data).await;
                        }
                    }
                }
            }

            d.assert_consistent().await;

            // Dropping everything and sweeping leaves nothing behind.
            for (manifest, _) in live.drain(..) {
                d.engine(0).discard(manifest.id).await.unwrap();
            }
            d.engine(1).sweep_all().await.unwrap();
            assert_eq!(d.stored_chunks().await, 0);
        });
    }

    /// Concurrent producers and a sweeper: whatever commits stays readable.
    #[test]
    fn concurrent_ops_never_lose_live_chunks(
        plans in prop::collection::vec(
            prop::collection::vec((prop::collection::vec(0..BLOCKS.len(), 1..5), any::<bool>()), 1..8),
            2..4,
        ),
        sweeps in 1..20usize,
    ) {
        runtime().block_on(async {
            let d = Arc::new(Deployment::new(3, fixed_config(4)));

            let producers: Vec<_> = plans
                .into_iter()
                .enumerate()
                .map(|(worker, plan)| {
                    let d = d.clone();
                    tokio::spawn(async move {
                        let engine = d.engine(worker % 2).clone();
                        let mut kept = Vec::new();
                        for (blocks, discard) in plan {
                            let data = payload(&blocks);
                            let manifest = loop {
                                match engine.store(&data).await {
                                    Ok(m) => break m,
                                    Err(e) if e.is_retryable() => tokio::task::yield_now().await,
                                    Err(e) => panic!("store failed: {e}"),
                                }
                            };
                            if discard {
                                engine.discard(manifest.id).await.unwrap();
                            } else {
                                kept.push((manifest, data));
                            }
                            tokio::task::yield_now().await;
                        }
                        kept
                    })
                })
                .collect();

            let sweeper = {
                let d = d.clone();
                tokio::spawn(async move {
                    for _ in 0..sweeps {
                        d.engine(2).sweep(3).await.unwrap();
                        tokio::task::yield_now().await;
                    }
                })
            };

            let mut kept = Vec::new();
            for producer in producers {
                kept.extend(producer.await.unwrap());
            }
            sweeper.await.unwrap();
            d.engine(2).sweep_all().await.unwrap();

            for (manifest, data) in &kept {
                assert_roundtrip(d.engine(0), manifest, data).await;
            }
            d.assert_consistent().await;
        });
    }
}
