//! Chaos test: concurrent writers, discards and sweeps while the store
//! randomly drops writes. Once the faults stop and audit has run, every
//! committed payload must still be readable and the counters must match.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tessera_engine::{EngineError, Tessera};
use tessera_integration_tests::{Deployment, assert_roundtrip, small_config, test_data_seeded};
use tessera_types::Manifest;

/// A shared 8 KiB prefix per project followed by 2 KiB unique to the job.
fn payload(project: u32, job: u32) -> Vec<u8> {
    let mut data = test_data_seeded(8_192, project);
    data.extend(test_data_seeded(2_048, 1_000 + job));
    data
}

/// Store with retries; `None` when the store gave up with state left for audit.
async fn store_retrying(engine: &Tessera, payload: &[u8]) -> Option<Manifest> {
    for _ in 0..20 {
        match engine.store(payload).await {
            Ok(manifest) => return Some(manifest),
            Err(e) if e.is_retryable() => tokio::time::sleep(Duration::from_millis(2)).await,
            Err(EngineError::RollbackIncomplete { .. }) => return None,
            Err(e) => panic!("unexpected store error: {e}"),
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ntest::timeout(120000)]
async fn test_flaky_store_keeps_committed_payloads() {
    let d = Arc::new(Deployment::with_chaos(3, small_config(), (0, 2), 42));
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..4u32)
        .map(|worker| {
            let d = d.clone();
            tokio::spawn(async move {
                let engine = d.engine(worker as usize % d.len()).clone();
                let mut kept = Vec::new();
                for job in 0..6u32 {
                    let log = payload(worker % 2, worker * 100 + job);
                    let Some(manifest) = store_retrying(&engine, &log).await else {
                        continue;
                    };
                    if job % 3 == 2 {
                        // A failed discard may or may not have removed the
                        // manifest; audit settles either way.
                        let _ = engine.discard(manifest.id).await;
                    } else {
                        kept.push((manifest, log));
                    }
                }
                kept
            })
        })
        .collect();

    let chaos = {
        let d = d.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let mut n = 1;
            while !done.load(Ordering::SeqCst) {
                d.chaos().fail_nth_write(n % 17 + 1);
                n += 5;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
    };

    let sweeper = {
        let d = d.clone();
        let done = done.clone();
        tokio::spawn(async move {
            while !done.load(Ordering::SeqCst) {
                let _ = d.engine(2).sweep(16).await;
                tokio::time::sleep(Duration::from_millis(3)).await;
            }
        })
    };

    let mut kept = Vec::new();
    for writer in writers {
        kept.extend(writer.await.unwrap());
    }
    done.store(true, Ordering::SeqCst);
    chaos.await.unwrap();
    sweeper.await.unwrap();

    d.chaos().heal();
    assert!(d.chaos().injected_failures() > 0);
    assert!(!kept.is_empty());

    // Tombstones and intents left behind by failed calls are now abandoned.
    tokio::time::sleep(Duration::from_millis(2_200)).await;
    d.engine(1).audit(false).await.unwrap();
    d.engine(2).sweep_all().await.unwrap();

    for (manifest, log) in &kept {
        assert_roundtrip(d.engine(0), manifest, log).await;
    }
    let report = d.assert_consistent().await;
    assert!(report.intents_live == 0 && report.unstable_skipped == 0, "{report:?}");
}
