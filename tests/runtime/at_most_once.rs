use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use promptwarden::decision_store::{DecisionOrigin, SqliteDecisionStore};
use promptwarden::storage::open_pool;
use tempfile::TempDir;

async fn on_disk_store(dir: &TempDir) -> SqliteDecisionStore {
    let pool = open_pool(&dir.path().join("decisions.db")).await.unwrap();
    SqliteDecisionStore::new(pool, Duration::from_secs(2))
        .await
        .unwrap()
}

#[tokio::test]
async fn concurrent_deciders_compute_exactly_once() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(on_disk_store(&dir).await);
    let computed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for caller in 0..8 {
        let store = Arc::clone(&store);
        let computed = Arc::clone(&computed);
        tasks.push(tokio::spawn(async move {
            store
                .decide_once("prompt-1", move || async move {
                    computed.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(format!("decided by caller {caller}"))
                })
                .await
                .unwrap()
        }));
    }

    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }

    assert_eq!(computed.load(Ordering::SeqCst), 1);
    let first = &outcomes[0].decision;
    assert!(outcomes.iter().all(|o| &o.decision == first));
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| o.origin == DecisionOrigin::Computed)
            .count(),
        1
    );
}

#[tokio::test]
async fn recorded_decision_survives_a_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = on_disk_store(&dir).await;
        let outcome = store
            .decide_once("prompt-2", || async { Ok("allow".to_string()) })
            .await
            .unwrap();
        assert!(outcome.is_fresh());
    }

    let reopened = on_disk_store(&dir).await;
    let outcome = reopened
        .decide_once("prompt-2", || async {
            Err::<String, _>(anyhow::anyhow!("must not recompute"))
        })
        .await
        .unwrap();
    assert_eq!(outcome.decision, "allow");
    assert_eq!(outcome.origin, DecisionOrigin::Recorded);
    assert_eq!(reopened.count().await.unwrap(), 1);
}

#[tokio::test]
async fn failed_computation_leaves_the_prompt_undecided() {
    let dir = TempDir::new().unwrap();
    let store = on_disk_store(&dir).await;

    let failed = store
        .decide_once("prompt-3", || async {
            Err::<String, _>(anyhow::anyhow!("evaluator crashed"))
        })
        .await;
    assert!(failed.is_err());

    let retried = store
        .decide_once("prompt-3", || async { Ok("deny".to_string()) })
        .await
        .unwrap();
    assert_eq!(retried.decision, "deny");
    assert!(retried.is_fresh());
}
