//! Durable state on the Fjall backend.

use std::sync::Arc;

use tessera_engine::{EngineError, Tessera};
use tessera_integration_tests::{assert_roundtrip, build_log, small_config, test_data_seeded};
use tessera_kv::{FjallKv, KvStore};
use tessera_types::EngineConfig;

fn open(path: &std::path::Path, config: EngineConfig) -> Tessera {
    let kv: Arc<dyn KvStore> = Arc::new(FjallKv::open(path).unwrap());
    Tessera::new(config, kv).unwrap()
}

/// Manifests, counters and discards survive closing and reopening the store.
#[tokio::test]
#[ntest::timeout(60000)]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let payloads: Vec<Vec<u8>> = (0..3).map(|job| build_log(9, job)).collect();

    let (manifests, discarded) = {
        let engine = open(dir.path(), small_config());
        let mut manifests = Vec::new();
        for payload in &payloads {
            manifests.push(engine.store(payload).await.unwrap());
        }
        engine.discard(manifests[1].id).await.unwrap();
        let discarded = manifests.remove(1);
        (manifests, discarded)
    };

    let engine = open(dir.path(), small_config());
    assert_roundtrip(&engine, &manifests[0], &payloads[0]).await;
    assert_roundtrip(&engine, &manifests[1], &payloads[2]).await;
    assert_eq!(engine.manifest(manifests[1].id).await.unwrap(), manifests[1]);
    assert!(matches!(
        engine.manifest(discarded.id).await,
        Err(EngineError::ManifestNotFound(_))
    ));

    // Only the discarded log's unique chunks are reclaimable.
    engine.sweep_all().await.unwrap();
    assert_roundtrip(&engine, &manifests[0], &payloads[0]).await;
    assert_roundtrip(&engine, &manifests[1], &payloads[2]).await;

    let report = engine.audit(true).await.unwrap();
    assert!(report.is_clean(), "{report:?}");
    assert_eq!(report.manifests_scanned, 2);
}

/// Two namespaces on one store never see each other's data.
#[tokio::test]
async fn test_namespaces_are_isolated() {
    let kv: Arc<dyn KvStore> = Arc::new(FjallKv::open_temporary().unwrap());
    let mut config_a = small_config();
    config_a.key_prefix = "a:".to_string();
    let mut config_b = small_config();
    config_b.key_prefix = "b:".to_string();
    let a = Tessera::new(config_a, kv.clone()).unwrap();
    let b = Tessera::new(config_b, kv).unwrap();

    let data = test_data_seeded(30_000, 5);
    let in_a = a.store(&data).await.unwrap();
    let in_b = b.store(&data).await.unwrap();
    assert_eq!(in_a.hashes().collect::<Vec<_>>(), in_b.hashes().collect::<Vec<_>>());

    assert!(matches!(
        b.manifest(in_a.id).await,
        Err(EngineError::ManifestNotFound(_))
    ));

    // Freeing everything in one namespace leaves the other intact.
    a.discard(in_a.id).await.unwrap();
    let swept = a.sweep_all().await.unwrap();
    assert_eq!(swept.reclaimed, in_a.hashes().collect::<std::collections::HashSet<_>>().len());
    assert_roundtrip(&b, &in_b, &data).await;
    assert!(b.audit(true).await.unwrap().is_clean());
}
