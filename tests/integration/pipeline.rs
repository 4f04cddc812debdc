//! Store/reconstruct pipeline across engine instances.

use std::collections::HashSet;

use tessera_engine::EngineError;
use tessera_integration_tests::{
    Deployment, assert_roundtrip, build_log, fixed_config, small_config, test_data,
    test_data_seeded,
};
use tessera_types::ChunkHash;

/// Write and read payloads from empty to 1 MB, covering every chunker edge.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_data_size_spectrum() {
    let d = Deployment::new(2, small_config());

    let sizes: Vec<usize> = vec![
        0,         // empty
        1,         // single byte
        255,       // min_size - 1
        256,       // exactly min_size
        257,       // min_size + 1
        4_095,     // max_size - 1
        4_096,     // exactly max_size
        4_097,     // max_size + 1
        100_000,   // ~100 chunks
        1_000_000, // ~1 MB
    ];

    for (i, &size) in sizes.iter().enumerate() {
        let data = test_data_seeded(size, i as u32 + 7777);
        let writer = i % 2;
        let manifest = d.engine(writer).store(&data).await.unwrap();
        assert_eq!(manifest.total_size, size as u64);

        // Read back through the other instance.
        let reader = d.engine(1 - writer);
        let loaded = reader.manifest(manifest.id).await.unwrap();
        assert_eq!(loaded, manifest);
        assert_roundtrip(reader, &loaded, &data).await;
    }

    d.assert_consistent().await;
}

/// Consecutive build logs of one project share nearly all their chunks.
#[tokio::test]
async fn test_build_logs_deduplicate() {
    let d = Deployment::new(3, small_config());

    let mut manifests = Vec::new();
    let mut logical_chunks = 0;
    for job in 0..12u32 {
        let log = build_log(1, job);
        let manifest = d.engine(job as usize % 3).store(&log).await.unwrap();
        logical_chunks += manifest.chunk_count();
        manifests.push((manifest, log));
    }

    let stored = d.stored_chunks().await;
    assert!(
        stored * 3 < logical_chunks,
        "expected heavy reuse: {stored} stored for {logical_chunks} referenced"
    );

    for (manifest, log) in &manifests {
        assert_roundtrip(d.engine(0), manifest, log).await;
    }
    d.assert_consistent().await;
}

/// Inserting bytes near the front only disturbs the chunks around the edit.
#[tokio::test]
async fn test_insertion_keeps_later_chunks() {
    let d = Deployment::new(1, small_config());
    let original = test_data(64 * 1024);
    let mut edited = b"inserted header line\n".to_vec();
    edited.extend_from_slice(&original);

    let a = d.engine(0).store(&original).await.unwrap();
    let b = d.engine(0).store(&edited).await.unwrap();

    let ha: HashSet<ChunkHash> = a.hashes().collect();
    let hb: HashSet<ChunkHash> = b.hashes().collect();
    let shared = ha.intersection(&hb).count();
    assert!(
        shared * 10 >= ha.len() * 9,
        "only {shared} of {} chunks survived the insertion",
        ha.len()
    );
}

/// A discard on one instance and a sweep on another free the chunks.
#[tokio::test]
async fn test_discard_and_sweep_across_instances() {
    let d = Deployment::new(3, fixed_config(4));

    let first = d.engine(0).store(b"AAAABBBBCCCC").await.unwrap();
    let second = d.engine(1).store(b"AAAABBBBDDDD").await.unwrap();
    assert_eq!(d.stored_chunks().await, 4);

    d.engine(1).discard(first.id).await.unwrap();
    let report = d.engine(2).sweep_all().await.unwrap();
    assert_eq!(report.reclaimed, 1);
    assert_eq!(d.stored_chunks().await, 3);

    assert!(matches!(
        d.engine(0).manifest(first.id).await,
        Err(EngineError::ManifestNotFound(_))
    ));
    assert!(matches!(
        d.engine(0).reconstruct(&first).await,
        Err(EngineError::ChunkMissing { index: 2, .. })
    ));
    assert_roundtrip(d.engine(0), &second, b"AAAABBBBDDDD").await;
    d.assert_consistent().await;
}

/// Oversized payloads are refused before anything is written.
#[tokio::test]
async fn test_payload_limit() {
    let mut config = small_config();
    config.max_payload_size = 10_000;
    let d = Deployment::new(1, config);

    d.engine(0).store(&test_data(10_000)).await.unwrap();
    let err = d.engine(0).store(&test_data(10_001)).await.unwrap_err();
    assert!(matches!(err, EngineError::PayloadTooLarge { .. }));
    assert!(!err.is_retryable());
}
