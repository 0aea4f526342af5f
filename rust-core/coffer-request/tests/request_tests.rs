// SPDX-License-Identifier: PMPL-1.0-or-later
//! Request lifecycle tests: lazy open, commit, abort, doom, pooling

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coffer_db::{DbError, Kwargs, StorageConfig};
use coffer_request::{AppConfig, Application, Coffer, RequestError, Signal, TeardownState};
use coffer_storage::{InMemoryBackend, StorageBackend, StorageError};
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error("division by zero")]
    ZeroDivision,
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl From<DbError> for AppError {
    fn from(e: DbError) -> Self {
        Self::Request(e.into())
    }
}

fn memory_engine() -> Result<Arc<dyn StorageBackend>, StorageError> {
    Ok(Arc::new(InMemoryBackend::new()))
}

/// Every supported shape of the `COFFER_STORAGE` setting.
fn storage_shapes() -> Vec<(&'static str, StorageConfig)> {
    let mut kwargs = Kwargs::new();
    kwargs.insert("database_name".into(), "from-factory".into());
    vec![
        ("uri", StorageConfig::uri("memory://")),
        ("factory", StorageConfig::factory(memory_engine, kwargs)),
        ("bare", StorageConfig::bare(memory_engine)),
    ]
}

fn app_with(storage: StorageConfig) -> Arc<Application> {
    let mut app = Application::with_config("test", AppConfig::with_storage(storage));
    Coffer::with_app(&mut app).unwrap();
    Arc::new(app)
}

async fn read_answer(app: &Arc<Application>) -> Option<i64> {
    app.request(|ctx| {
        Box::pin(async move { Ok::<_, RequestError>(ctx.data().await?.get("answer").await?) })
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_connection_opens_lazily_for_every_shape() {
    for (shape, storage) in storage_shapes() {
        let app = app_with(storage);
        app.request(|ctx| {
            Box::pin(async move {
                assert!(!ctx.is_connected(), "{shape}: connected before access");
                ctx.data().await?;
                assert!(ctx.is_connected(), "{shape}: not connected after access");
                Ok::<_, RequestError>(())
            })
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_binding_twice_fails() {
    let mut app = Application::new("twice");
    Coffer::with_app(&mut app).unwrap();
    assert!(matches!(
        Coffer::with_app(&mut app),
        Err(RequestError::DoubleInitialization(_))
    ));
    assert!(matches!(
        Coffer::new().init_app(&mut app),
        Err(RequestError::DoubleInitialization(_))
    ));
}

#[tokio::test]
async fn test_commit_on_success_for_every_shape() {
    for (shape, storage) in storage_shapes() {
        let app = app_with(storage);
        app.request(|ctx| {
            Box::pin(async move {
                ctx.data().await?.insert("answer", &42)?;
                Ok::<_, RequestError>(())
            })
        })
        .await
        .unwrap();
        assert_eq!(read_answer(&app).await, Some(42), "{shape}");
    }
}

#[tokio::test]
async fn test_abort_on_error_for_every_shape() {
    for (shape, storage) in storage_shapes() {
        let app = app_with(storage);
        let result: Result<(), AppError> = app
            .request(|ctx| {
                Box::pin(async move {
                    ctx.data().await?.insert("answer", &42)?;
                    Err(AppError::ZeroDivision)
                })
            })
            .await;
        assert!(matches!(result, Err(AppError::ZeroDivision)), "{shape}");
        assert_eq!(read_answer(&app).await, None, "{shape}");
    }
}

#[tokio::test]
async fn test_abort_on_doom_for_every_shape() {
    for (shape, storage) in storage_shapes() {
        let app = app_with(storage);
        app.request(|ctx| {
            Box::pin(async move {
                ctx.data().await?.insert("answer", &42)?;
                ctx.doom()?;
                assert!(ctx.is_doomed());
                Ok::<_, RequestError>(())
            })
        })
        .await
        .unwrap();
        assert_eq!(read_answer(&app).await, None, "{shape}");
    }
}

#[tokio::test]
async fn test_transfer_counts() {
    let app = app_with(StorageConfig::uri("memory://"));

    let mut ctx = app.context();
    let root = ctx.data().await.unwrap();
    assert_eq!(ctx.baseline_transfers().unwrap().loads, 0);
    assert_eq!(root.get::<i64>("answer").await.unwrap(), None);
    assert_eq!(ctx.transfers().unwrap().loads, 1);
    root.insert("answer", &42).unwrap();
    app.teardown(&mut ctx, None).await.unwrap();

    let captured = ctx.final_transfers().unwrap();
    assert!(captured.stores > 0);
    assert_eq!(captured.loads, 1);
    assert_eq!(ctx.teardown_state(), TeardownState::Closed);

    // The capture cleared the pooled connection's counters, so the next
    // request starts from a zero baseline on the same connection.
    let mut ctx = app.context();
    ctx.connection().await.unwrap();
    let baseline = ctx.baseline_transfers().unwrap();
    assert!(baseline.is_zero());
    app.teardown(&mut ctx, None).await.unwrap();
}

#[tokio::test]
async fn test_baseline_is_not_cleared_on_open() {
    let app = app_with(StorageConfig::uri("memory://"));
    let db = app.database().await.unwrap();

    // Leave counts on a pooled connection without going through teardown.
    let conn = db.open().await.unwrap();
    conn.load("root:x").await.unwrap();
    conn.close();

    let mut ctx = app.context();
    ctx.connection().await.unwrap();
    assert_eq!(ctx.baseline_transfers().unwrap().loads, 1);
    // Reading the baseline did not reset the counters.
    assert_eq!(ctx.transfers().unwrap().loads, 1);
    app.teardown(&mut ctx, None).await.unwrap();
    assert_eq!(ctx.final_transfers().unwrap().loads, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_access_builds_one_pool() {
    let builds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&builds);
    let storage = StorageConfig::bare(move || -> Result<Arc<dyn StorageBackend>, StorageError> {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        Ok(Arc::new(InMemoryBackend::new()))
    });
    let app = app_with(storage);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let app = Arc::clone(&app);
            tokio::spawn(async move {
                app.request(move |ctx| {
                    Box::pin(async move {
                        ctx.data().await?.insert(&format!("k{i}"), &i)?;
                        Ok::<_, RequestError>(())
                    })
                })
                .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    let db = app.database().await.unwrap();
    assert_eq!(db.last_transaction(), 8);
    assert_eq!(db.open_connections(), 0);
}

#[tokio::test]
async fn test_sequential_requests_do_not_leak_connections() {
    let app = app_with(StorageConfig::uri("memory://?pool_size=2"));
    let db = app.database().await.unwrap();

    for i in 0..20_i64 {
        let result: Result<(), AppError> = app
            .request(move |ctx| {
                Box::pin(async move {
                    ctx.data().await?.insert("n", &i)?;
                    match i % 3 {
                        0 => Ok(()),
                        1 => Err(AppError::ZeroDivision),
                        _ => {
                            ctx.doom()?;
                            Ok(())
                        }
                    }
                })
            })
            .await;
        assert_eq!(result.is_err(), i % 3 == 1);
        assert_eq!(db.open_connections(), 0, "request {i} leaked");
    }
    assert!(db.idle_connections() <= 2);
    let monitor = db.activity_monitor().unwrap();
    assert_eq!(monitor.connections_opened(), 20);
    assert_eq!(monitor.connections_closed(), 20);
}

#[tokio::test]
async fn test_requests_without_data_access_never_connect() {
    let opened = Arc::new(AtomicUsize::new(0));
    let mut app = Application::with_config("quiet", AppConfig::with_storage("memory://"));
    let coffer = Coffer::with_app(&mut app).unwrap();
    let counter = Arc::clone(&opened);
    coffer.on_connection_opened(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let app = Arc::new(app);

    app.request(|_ctx| Box::pin(async { Ok::<_, RequestError>(()) }))
        .await
        .unwrap();
    assert_eq!(opened.load(Ordering::SeqCst), 0);
    assert!(app
        .extension(coffer_request::EXTENSION_KEY)
        .unwrap()
        .built_database()
        .is_none());
}

#[tokio::test]
async fn test_signals_fire_in_lifecycle_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut app = Application::with_config("signals", AppConfig::with_storage("memory://"));
    let coffer = Coffer::with_app(&mut app).unwrap();
    for signal in [
        Signal::ConnectionOpened,
        Signal::ConnectionWillClose,
        Signal::ConnectionClosed,
    ] {
        let log = Arc::clone(&log);
        coffer
            .signals()
            .connect(signal, move || log.lock().push(signal));
    }
    let app = Arc::new(app);

    app.request(|ctx| {
        Box::pin(async move {
            ctx.data().await?;
            ctx.data().await?;
            Ok::<_, RequestError>(())
        })
    })
    .await
    .unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            Signal::ConnectionOpened,
            Signal::ConnectionWillClose,
            Signal::ConnectionClosed
        ]
    );
}

#[tokio::test]
async fn test_commit_conflict_propagates_from_teardown() {
    let app = app_with(StorageConfig::uri("memory://"));
    app.request(|ctx| {
        Box::pin(async move {
            ctx.data().await?.insert("counter", &0)?;
            Ok::<_, RequestError>(())
        })
    })
    .await
    .unwrap();

    let mut first = app.context();
    let mut second = app.context();
    for ctx in [&mut first, &mut second] {
        let root = ctx.data().await.unwrap();
        let n: i64 = root.get("counter").await.unwrap().unwrap();
        root.insert("counter", &(n + 1)).unwrap();
    }

    app.teardown(&mut first, None).await.unwrap();
    let err = app.teardown(&mut second, None).await.unwrap_err();
    assert!(err.is_conflict(), "unexpected error: {err}");

    // The losing request still released its connection.
    let db = app.database().await.unwrap();
    assert_eq!(db.open_connections(), 0);
    assert_eq!(second.teardown_state(), TeardownState::Closed);
    assert_eq!(
        app.request(|ctx| {
            Box::pin(async move { Ok::<_, RequestError>(ctx.data().await?.get::<i64>("counter").await?) })
        })
        .await
        .unwrap(),
        Some(1)
    );
}

#[tokio::test]
async fn test_missing_configuration_and_backend_errors_surface() {
    let mut app = Application::new("unconfigured");
    Coffer::with_app(&mut app).unwrap();
    let app = Arc::new(app);
    let err = app
        .request(|ctx| Box::pin(async move { ctx.data().await.map(|_| ()) }))
        .await
        .unwrap_err();
    assert!(err.is_configuration());

    let app = app_with(StorageConfig::bare(
        || -> Result<Arc<dyn StorageBackend>, StorageError> {
            Err(StorageError::BackendUnavailable("no route to host".into()))
        },
    ));
    let err = app
        .request(|ctx| Box::pin(async move { ctx.data().await.map(|_| ()) }))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RequestError::Db(DbError::Storage(StorageError::BackendUnavailable(_)))
    ));
}

#[tokio::test]
async fn test_lost_transfer_counts_fail_teardown_after_release() {
    let app = app_with(StorageConfig::uri("memory://"));
    let mut ctx = app.context();
    ctx.data().await.unwrap();
    // The handler closes the connection behind the request's back.
    assert!(ctx.connection().await.unwrap().close());

    let err = app.teardown(&mut ctx, None).await.unwrap_err();
    assert!(
        matches!(err, RequestError::Db(DbError::ConnectionClosed(_))),
        "unexpected error: {err}"
    );
    assert_eq!(ctx.teardown_state(), TeardownState::Closed);
    assert_eq!(ctx.final_transfers(), None);
    let db = app.database().await.unwrap();
    assert_eq!(db.open_connections(), 0);
}
