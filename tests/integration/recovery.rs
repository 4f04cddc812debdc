//! Recovery after crashes: abandoned intents, unknown commit outcomes and
//! tombstones left by a dead sweeper.

use std::time::Duration;

use bytes::Bytes;
use tessera_engine::{EngineError, IntentKind, TOMBSTONE};
use tessera_integration_tests::{
    Deployment, assert_roundtrip, fixed_config, small_config, test_data,
};
use tessera_kv::KvStore;
use tessera_types::ChunkHash;

/// Longer than the pending timeout of the test configuration.
const PAST_PENDING: Duration = Duration::from_millis(2_200);

/// A store whose compensation also failed is settled by a later audit.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_crashed_store_is_settled_by_audit() {
    let d = Deployment::with_chaos(2, fixed_config(4), (0, 0), 1);

    // intent, add A, put A, add B, then every write fails.
    d.chaos().fail_writes_after(4);
    let err = d.engine(0).store(b"AAAABBBBCCCC").await.unwrap_err();
    assert!(
        matches!(err, EngineError::RollbackIncomplete { pending: 2, .. }),
        "{err:?}"
    );
    d.chaos().heal();

    let a = ChunkHash::from_data(b"AAAA");
    let b = ChunkHash::from_data(b"BBBB");
    assert_eq!(d.ref_count(&a).await, 1);
    assert_eq!(d.ref_count(&b).await, 1);

    // The intent is still fresh: its hashes are left alone.
    let early = d.engine(1).audit(false).await.unwrap();
    assert_eq!(early.intents_live, 1);
    assert!(early.repairs.is_empty(), "{early:?}");
    assert!(early.unstable_skipped >= 2);
    assert_eq!(d.ref_count(&a).await, 1);

    tokio::time::sleep(PAST_PENDING).await;

    let late = d.engine(1).audit(false).await.unwrap();
    assert_eq!(late.intents_reaped, 1);
    assert_eq!(late.over_counted, 2, "{late:?}");
    assert_eq!(d.ref_count(&a).await, 0);
    assert_eq!(d.ref_count(&b).await, 0);
    assert!(d.engine(0).registry().intents().await.unwrap().is_empty());

    d.engine(1).sweep_all().await.unwrap();
    assert_eq!(d.stored_chunks().await, 0);
    d.assert_consistent().await;

    // The same payload stores cleanly afterwards.
    let manifest = d.engine(0).store(b"AAAABBBBCCCC").await.unwrap();
    assert_roundtrip(d.engine(1), &manifest, b"AAAABBBBCCCC").await;
}

/// A commit whose outcome cannot be read back keeps its references until
/// the intent is abandoned.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_unknown_commit_outcome_is_reaped() {
    let d = Deployment::with_chaos(1, small_config(), (0, 0), 2);
    let data = test_data(20_000);

    d.chaos().fail_matching(b"manifest/");
    let err = d.engine(0).store(&data).await.unwrap_err();
    let EngineError::RollbackIncomplete { pending, .. } = err else {
        panic!("expected RollbackIncomplete, got {err:?}");
    };
    assert!(pending > 0);
    d.chaos().heal();

    let intents = d.engine(0).registry().intents().await.unwrap();
    assert_eq!(intents.len(), 1);
    assert_eq!(intents[0].intent.kind, IntentKind::Store);
    assert_eq!(intents[0].intent.hashes.len(), pending);

    tokio::time::sleep(PAST_PENDING).await;
    let report = d.engine(0).audit(false).await.unwrap();
    assert_eq!(report.intents_reaped, 1);
    assert!(report.repairs.len() <= pending);

    d.engine(0).sweep_all().await.unwrap();
    assert_eq!(d.stored_chunks().await, 0);
    d.assert_consistent().await;
}

/// A tombstone left by a sweeper that died mid-reclaim blocks stores only
/// until it expires.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_abandoned_tombstone_expires() {
    let d = Deployment::new(2, fixed_config(4));
    let first = d.engine(0).store(b"AAAA").await.unwrap();
    d.engine(0).discard(first.id).await.unwrap();

    // The dead sweeper got as far as swapping the zero counter for a
    // tombstone, then stopped before deleting the chunk.
    let hash = ChunkHash::from_data(b"AAAA");
    let ref_key = d.engine(0).keys().refs(&hash);
    assert!(d.mem().remove(&ref_key));
    let kv: &dyn KvStore = d.mem().as_ref();
    assert!(
        kv.set_if_absent(&ref_key, Bytes::from_static(TOMBSTONE), Some(Duration::from_secs(1)))
            .await
            .unwrap()
    );

    let err = d.engine(1).store(b"AAAA").await.unwrap_err();
    assert!(err.is_retryable(), "{err:?}");
    assert!(!matches!(err, EngineError::RollbackIncomplete { .. }));
    assert!(d.engine(0).registry().manifests().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let second = d.engine(1).store(b"AAAA").await.unwrap();
    assert_eq!(d.ref_count(&hash).await, 1);
    assert_roundtrip(d.engine(0), &second, b"AAAA").await;

    // Sweeping now must leave the live chunk alone.
    let report = d.engine(0).sweep_all().await.unwrap();
    assert_eq!(report.reclaimed, 0);
    assert_roundtrip(d.engine(0), &second, b"AAAA").await;
    d.assert_consistent().await;
}

/// A discard interrupted after removing its manifest is finished by audit.
#[tokio::test]
#[ntest::timeout(30000)]
async fn test_interrupted_discard_is_settled_by_audit() {
    let d = Deployment::with_chaos(1, fixed_config(4), (0, 0), 3);
    let keep = d.engine(0).store(b"AAAABBBB").await.unwrap();
    let gone = d.engine(0).store(b"AAAACCCC").await.unwrap();

    let c = ChunkHash::from_data(b"CCCC");
    let c_pattern = format!("ref/{c}");
    d.chaos().fail_matching(c_pattern.as_bytes());
    d.engine(0).discard(gone.id).await.unwrap_err();
    d.chaos().heal();

    assert!(matches!(
        d.engine(0).manifest(gone.id).await,
        Err(EngineError::ManifestNotFound(_))
    ));
    assert_eq!(d.ref_count(&c).await, 1);

    tokio::time::sleep(PAST_PENDING).await;
    let report = d.engine(0).audit(false).await.unwrap();
    assert_eq!(report.intents_reaped, 1);
    assert_eq!(d.ref_count(&c).await, 0);

    d.engine(0).sweep_all().await.unwrap();
    assert_eq!(d.stored_chunks().await, 2);
    assert_roundtrip(d.engine(0), &keep, b"AAAABBBB").await;
    d.assert_consistent().await;
}
