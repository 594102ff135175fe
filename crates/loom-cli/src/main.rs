use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use loom_core::config::{self, AppConfig, MqBackend};
use loom_core::impls::InMemoryQueueClient;
use loom_core::{Engine, EngineError, SubmitOptions, TaskManagerBuilder, TaskMode};

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
    #[serde(default)]
    delay_ms: u64,
}

/// Mock engine: greets, after failing its first `n` calls.
struct HelloEngine {
    remaining_failures: AtomicU32,
}

impl HelloEngine {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl Engine for HelloEngine {
    async fn run(
        &self,
        payload: Arc<serde_json::Value>,
    ) -> Result<serde_json::Value, EngineError> {
        let p = HelloPayload::deserialize(payload.as_ref())
            .map_err(|e| EngineError::new(format!("json decode: {e}")))?;

        sleep(Duration::from_millis(p.delay_ms)).await;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(EngineError::new(format!("intentional failure (left={left})")));
        }

        Ok(serde_json::json!({ "greeting": format!("Hello, {}!", p.name) }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // (A) configuration and logging
    config::load_dotenv();
    let config = AppConfig::from_env()?;

    // RUST_LOG wins over the per-channel settings
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter_directives()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    config.log_summary();

    // (B) task manager with the mock engine; an in-memory broker is kept
    // here so its deliveries can be printed
    let memory = (config.dispatch.backend == MqBackend::Memory)
        .then(|| Arc::new(InMemoryQueueClient::new()));
    let builder = match &memory {
        Some(client) => TaskManagerBuilder::from_config_with_client(&config, client.clone()),
        None => TaskManagerBuilder::from_config(&config),
    };
    let manager = builder.engine(Arc::new(HelloEngine::new(1))).build()?;
    manager.start()?;

    // (C) a sync task: submit and wait
    let payload = serde_json::json!({ "name": "loom", "delay_ms": 50 });
    let id = manager.submit(payload, TaskMode::Sync, None)?;
    match manager.await_result(id, Duration::from_secs(5)).await {
        Ok(result) => tracing::info!(%id, %result, "sync task finished"),
        Err(e) => tracing::warn!(%id, error = %e, "sync task failed"),
    }

    // (D) a burst of async tasks; results go to the result dispatcher
    let mut ids = Vec::new();
    for i in 0..4 {
        let payload = serde_json::json!({ "name": format!("async-{i}"), "delay_ms": 20 });
        let options =
            SubmitOptions::default().callback_url(format!("http://localhost:8080/callback/{i}"));
        match manager.submit_with(payload, TaskMode::Async, options) {
            Ok(id) => ids.push(id),
            Err(e) => tracing::warn!(error = %e, "submission rejected"),
        }
    }
    println!("stats: {}", serde_json::to_string(&manager.stats())?);

    sleep(Duration::from_millis(300)).await;
    for id in ids {
        let snapshot = manager.get_status(id)?;
        println!("{}", serde_json::to_string(&snapshot)?);
    }
    println!("stats:  {}", serde_json::to_string(&manager.stats())?);
    println!("counts: {}", serde_json::to_string(&manager.status_counts())?);
    if let Some(client) = &memory {
        for message in client.drain() {
            println!("delivered [{}]: {}", message.topic, message.body);
        }
    }

    // (E) stop
    manager.shutdown().await;
    Ok(())
}
