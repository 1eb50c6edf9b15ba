use taskq_graceful_shutdown::GracefulShutdown;
use taskq_queue::Queue;
use tracing::{event, Level};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv::dotenv().ok();

    taskq::tracing_config::configure("taskq-reaper");

    let shutdown = GracefulShutdown::new();
    let config = taskq::Config::from_env(&shutdown)?;

    let pool = config.database.create_pool().await?;
    let queue = Queue::new(pool, shutdown.consumer()).await?;

    event!(
        Level::INFO,
        interval_secs = config.reaper_interval.as_secs(),
        timeout_secs = config.reaper_heartbeat_timeout.as_secs(),
        "reaper started"
    );

    let mut shutdown_waiter = shutdown.consumer();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.reaper_interval) => {}
            _ = shutdown_waiter.wait_for_shutdown() => break,
        }

        sweep(&queue, config.reaper_heartbeat_timeout).await;
    }

    Ok(())
}

/// One pass over stale leases. Never propagates a database error up into the main loop — a
/// single failed sweep just means we try again on the next tick.
async fn sweep(queue: &Queue, heartbeat_timeout: std::time::Duration) {
    let stale = match queue.heartbeats(heartbeat_timeout).await {
        Ok(stale) => stale,
        Err(e) => {
            event!(Level::ERROR, error = ?e, "failed to list stale heartbeats");
            return;
        }
    };

    for lease in stale {
        match queue.requeue(lease.id).await {
            Ok(()) => {
                event!(Level::WARN, task_id = %lease.id, token = %lease.token, "requeued task with stale heartbeat");
            }
            Err(taskq_queue::Error::NotRunning) | Err(taskq_queue::Error::NotExist) => {
                // The task finished or was requeued by something else between the heartbeat
                // scan and this requeue attempt; nothing left to do.
            }
            Err(e) => {
                event!(Level::ERROR, task_id = %lease.id, error = ?e, "failed to requeue stale task");
            }
        }
    }
}
