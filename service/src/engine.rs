//! Async front of the tape store.
//!
//! `TapeStore` is synchronous; every call is moved onto the blocking pool
//! with `spawn_blocking` and bounded by the configured call timeout. A call
//! that outlives the timeout is reported to the client as `Busy`. The
//! blocking task itself is not cancelled, so a timed-out write may still
//! commit.
//!
//! The engine also keeps the bookkeeping the idle timer needs: uptime,
//! open connections and the time of the last request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use tape_store::{Result, TapeError, TapeStore};
use tokio::sync::Mutex;

pub struct TapeEngine {
    store: Arc<TapeStore>,
    call_timeout: Duration,
    started_at: Instant,
    last_activity: Arc<Mutex<Instant>>,
    connection_count: Arc<AtomicU32>,
}

impl TapeEngine {
    /// Wrap `store`, taking the call timeout from `[service] call_timeout_ms`.
    pub fn new(store: TapeStore) -> Self {
        let call_timeout = Duration::from_millis(store.config().service.call_timeout_ms);
        let now = Instant::now();
        Self {
            store: Arc::new(store),
            call_timeout,
            started_at: now,
            last_activity: Arc::new(Mutex::new(now)),
            connection_count: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn store(&self) -> &TapeStore {
        &self.store
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Run `op` against the store on the blocking pool.
    ///
    /// `method` names the call in logs and in the `Busy` message.
    pub async fn call<F, T>(&self, method: &str, op: F) -> Result<T>
    where
        F: FnOnce(&TapeStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.touch().await;
        let store = Arc::clone(&self.store);
        let task = tokio::task::spawn_blocking(move || op(&store));

        match tokio::time::timeout(self.call_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(TapeError::internal(format!(
                "{method} task failed: {join_err}"
            ))),
            Err(_) => {
                tracing::warn!(
                    method,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(TapeError::busy(format!(
                    "{method} did not finish within {}ms",
                    self.call_timeout.as_millis()
                )))
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Activity tracking
    // ─────────────────────────────────────────────────────────────────────────────

    /// Service uptime in seconds.
    pub fn uptime_s(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Record activity (resets the idle timer).
    pub async fn touch(&self) {
        let mut ts = self.last_activity.lock().await;
        *ts = Instant::now();
    }

    /// Time elapsed since last activity.
    pub async fn last_activity_elapsed(&self) -> Duration {
        let ts = self.last_activity.lock().await;
        ts.elapsed()
    }

    pub fn connection_opened(&self) -> u32 {
        self.connection_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connection_closed(&self) -> u32 {
        self.connection_count
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1)
    }

    pub fn connection_count(&self) -> u32 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for TapeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapeEngine")
            .field("db_path", &self.store.config().db_path)
            .field("call_timeout", &self.call_timeout)
            .field("connections", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tape_store::{ErrorCategory, TapeConfig};

    fn engine() -> TapeEngine {
        TapeEngine::new(TapeStore::open(TapeConfig::in_memory()).expect("open store"))
    }

    #[tokio::test]
    async fn call_runs_on_the_store() {
        let engine = engine();
        let tape = engine
            .call("tape.create", |store| store.create_tape(Some("t")))
            .await
            .expect("create");
        let resolved = engine
            .call("tape.resolve", |store| store.resolve("t"))
            .await
            .expect("resolve");
        assert_eq!(resolved, tape);
    }

    #[tokio::test]
    async fn store_errors_pass_through() {
        let err = engine()
            .call("tape.resolve", |store| store.resolve("missing"))
            .await
            .expect_err("unknown name");
        assert_eq!(err.category(), ErrorCategory::NotFound);
    }

    #[tokio::test]
    async fn slow_call_reports_busy() {
        let engine = engine().with_call_timeout(Duration::from_millis(20));
        let err = engine
            .call("slow", |_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .expect_err("timeout");
        assert_eq!(err.category(), ErrorCategory::Busy);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn file_config_without_service_section_keeps_timeout() {
        let cfg = TapeConfig::from_toml("db_path = \":memory:\"\n").expect("parse");
        let engine = TapeEngine::new(TapeStore::open(cfg).expect("open store"));
        assert_eq!(engine.call_timeout(), Duration::from_millis(5_000));
        engine
            .call("slowish", |_| {
                std::thread::sleep(Duration::from_millis(5));
                Ok(())
            })
            .await
            .expect("finishes within the default timeout");
    }

    #[tokio::test]
    async fn connection_bookkeeping() {
        let engine = engine();
        assert_eq!(engine.connection_opened(), 1);
        assert_eq!(engine.connection_opened(), 2);
        assert_eq!(engine.connection_closed(), 1);
        assert_eq!(engine.connection_count(), 1);
        assert!(engine.uptime_s() < 5);

        engine.touch().await;
        assert!(engine.last_activity_elapsed().await < Duration::from_secs(5));
    }
}
