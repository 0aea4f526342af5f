// SPDX-License-Identifier: PMPL-1.0-or-later
//! Concurrent commits through one pool

use std::sync::Arc;

use coffer_db::{ActivityMonitor, Database, DbError};
use coffer_txn::{TransactionError, TransactionManager};

/// Read-modify-write of a counter, retried until it wins the commit race.
async fn increment(db: &Database) -> usize {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let conn = db.open().await.unwrap();
        let mut txn = TransactionManager::new();
        txn.begin();
        conn.join(&mut txn).unwrap();
        let root = conn.root();

        let current: i64 = root.get("counter").await.unwrap().unwrap_or(0);
        tokio::task::yield_now().await;
        root.insert("counter", &(current + 1)).unwrap();

        let outcome = txn.commit().await;
        conn.close();
        match outcome {
            Ok(()) => return attempts,
            Err(TransactionError::Conflict { .. }) => continue,
            Err(other) => panic!("unexpected commit error: {other}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_increments_never_lose_updates() {
    let db = Database::in_memory();
    let tasks = 16;

    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let db = db.clone();
            tokio::spawn(async move { increment(&db).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let conn = db.open().await.unwrap();
    let value: Option<i64> = conn.root().get("counter").await.unwrap();
    assert_eq!(value, Some(tasks));
    conn.close();
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_monitor_counts_every_lease() {
    let db = Database::in_memory();
    let monitor = Arc::new(ActivityMonitor::default());
    db.set_activity_monitor(Some(Arc::clone(&monitor)));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = db.clone();
            tokio::spawn(async move {
                let conn = db.open().await?;
                let mut txn = TransactionManager::new();
                txn.begin();
                conn.join(&mut txn)?;
                conn.root().insert(&format!("k{i}"), &i)?;
                txn.commit().await?;
                conn.close();
                Ok::<_, DbError>(())
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(monitor.connections_opened(), 8);
    assert_eq!(monitor.connections_closed(), 8);
    let report = monitor.activity(None, None, 4);
    assert_eq!(report.total_stores(), 8);
    assert_eq!(db.last_transaction(), 8);
}
