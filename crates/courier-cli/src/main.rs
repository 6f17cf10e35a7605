use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, sleep};
use tracing_subscriber::EnvFilter;

use courier_core::{
    CourierConfig, DeliveryError, PersistentQueue, RemoteSubmitter, SubmitterBuilder,
};

#[derive(Debug, Deserialize)]
struct TestReport {
    serial: String,
    result: String,
}

/// Stand-in for the remote collector: the first few calls time out, reports
/// without a serial are rejected as invalid.
struct FlakyCollector {
    outages_left: AtomicU32,
}

impl FlakyCollector {
    fn new(outages: u32) -> Self {
        Self {
            outages_left: AtomicU32::new(outages),
        }
    }
}

#[async_trait]
impl RemoteSubmitter for FlakyCollector {
    async fn submit(&self, payload: &serde_json::Value) -> Result<(), DeliveryError> {
        let report: TestReport = serde_json::from_value(payload.clone())
            .map_err(|e| DeliveryError::permanent(format!("invalid report: {e}")))?;

        sleep(Duration::from_millis(50)).await;
        let left = self.outages_left.load(Ordering::Relaxed);
        if left > 0 {
            self.outages_left.fetch_sub(1, Ordering::Relaxed);
            return Err(DeliveryError::transient(format!(
                "collector timeout (outages left={left})"
            )));
        }

        tracing::info!(serial = %report.serial, result = %report.result, "collector accepted report");
        Ok(())
    }
}

fn load_config() -> Result<CourierConfig, Box<dyn std::error::Error>> {
    let mut config = match std::env::var_os("COURIER_CONFIG") {
        Some(path) => CourierConfig::from_path(path.as_ref())?,
        None => {
            let mut config = CourierConfig::default();
            // demo pacing: fast polls and short cooldowns
            config.submitter.poll_interval_ms = 200;
            config.submitter.retry_after_ms = 500;
            config
        }
    };
    if let Some(dir) = std::env::var_os("COURIER_QUEUE_DIR") {
        config.queue.dir = dir.into();
    } else if std::env::var_os("COURIER_CONFIG").is_none() {
        config.queue.dir = std::env::temp_dir().join("courier-demo-queue");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) queue を開く（前回の残りがあれば crash recovery 込みで読み込まれる）
    let config = load_config()?;
    let queue = Arc::new(PersistentQueue::open(config.queue.clone())?);
    println!("queue dir: {}", queue.dir().display());
    println!("loaded: {:?}", queue.counts());

    // (B) submitter を組み立てて起動
    let remote = Arc::new(FlakyCollector::new(3));
    let submitter = SubmitterBuilder::from_config(Arc::clone(&queue), remote, &config).build()?;
    let handle = submitter.spawn()?;

    // (C) レポート投入（1 件は壊れた payload）
    for n in 1..=5 {
        let report = serde_json::json!({
            "serial": format!("SN-{n:04}"),
            "result": if n % 2 == 0 { "Failed" } else { "Passed" },
        });
        let item = queue.add_with(report, None, Some(if n == 5 { 1 } else { 5 }))?;
        println!("queued: id={} priority={}", item.id, item.priority);
    }
    queue.add(serde_json::json!({ "garbage": true }))?;

    // (D) 配送が終わる（または Ctrl-C）まで counts を表示
    loop {
        let counts = queue.counts();
        println!("counts: {counts:?} stats: {:?}", submitter.stats());
        let settled = counts.is_drained() && queue.list_failed().iter().all(|i| !i.can_retry());
        if settled {
            break;
        }
        tokio::select! {
            _ = sleep(Duration::from_millis(250)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted");
                break;
            }
        }
    }

    for item in queue.dead_letters() {
        println!(
            "dead letter: id={} attempts={} last_error={:?}",
            item.id, item.attempts, item.last_error
        );
    }

    // (E) graceful shutdown: 送信中のものは待つ
    if !handle.stop().await {
        println!("stop timeout elapsed with uploads still in flight");
    }
    println!("breaker: {:?}", submitter.breaker().metrics());
    println!("removed {} completed items", queue.clear_completed()?);
    Ok(())
}
