//! Handler environment
//!
//! Each handler gets its own `HandlerEnv`. Work scheduled through it runs on
//! the handler worker pool; a panic inside that work is caught and logged with
//! the handler's name instead of taking down the process.

use attrmesh_core::{adapter::Env, panic_message, pool::WorkerPool};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use tracing::error;

#[derive(Debug, Clone)]
pub struct HandlerEnv {
    handler_name: String,
    pool: WorkerPool,
}

impl HandlerEnv {
    pub fn new(handler_name: impl Into<String>, pool: WorkerPool) -> Self {
        Self {
            handler_name: handler_name.into(),
            pool,
        }
    }
}

async fn contained(handler: String, kind: &'static str, work: BoxFuture<'static, ()>) {
    if let Err(payload) = AssertUnwindSafe(work).catch_unwind().await {
        error!(
            handler = %handler,
            kind,
            panic = %panic_message(payload.as_ref()),
            "Handler background work panicked"
        );
    }
}

impl Env for HandlerEnv {
    fn handler_name(&self) -> &str {
        &self.handler_name
    }

    fn schedule_work(&self, work: BoxFuture<'static, ()>) {
        let _ = self
            .pool
            .schedule(contained(self.handler_name.clone(), "work", work));
    }

    /// Runs as a dedicated task; daemons never occupy a worker slot.
    fn schedule_daemon(&self, work: BoxFuture<'static, ()>) {
        let _ = tokio::spawn(contained(self.handler_name.clone(), "daemon", work));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_env_runs_work_and_contains_panics() {
        let env = HandlerEnv::new("h1.a1.istio-system", WorkerPool::new(4));
        assert_eq!(env.handler_name(), "h1.a1.istio-system");

        let (tx, mut rx) = mpsc::unbounded_channel();

        let work_tx = tx.clone();
        env.schedule_work(Box::pin(async move {
            let _ = work_tx.send("work");
        }));
        let daemon_tx = tx.clone();
        env.schedule_daemon(Box::pin(async move {
            let _ = daemon_tx.send("daemon");
        }));

        env.schedule_work(Box::pin(async { panic!("bye!") }));
        env.schedule_daemon(Box::pin(async { panic!("bye!") }));

        let mut seen = vec![
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec!["daemon", "work"]);

        // The pool keeps working after the panics.
        tokio::time::sleep(Duration::from_millis(50)).await;
        env.schedule_work(Box::pin(async move {
            let _ = tx.send("after");
        }));
        assert_eq!(rx.recv().await.unwrap(), "after");
    }
}
