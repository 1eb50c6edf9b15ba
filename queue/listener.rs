use std::time::Duration;

use sqlx::postgres::PgListener;
use taskq_database::PostgresPool;
use taskq_graceful_shutdown::GracefulShutdownConsumer;
use tokio::sync::oneshot;
use tracing::{event, instrument, Level};

use crate::registry::DequeuerRegistry;

const CHANNEL: &str = "tasks";
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Owns the background task that holds a dedicated connection `LISTEN`ing on the `tasks`
/// channel and turns every notification into a broadcast on the [`DequeuerRegistry`]. One of
/// these lives for as long as a [`crate::Queue`] does; it shuts down when the
/// [`GracefulShutdownConsumer`] it was built with fires.
pub(crate) struct NotificationListener {
    join_handle: tokio::task::JoinHandle<()>,
}

impl NotificationListener {
    /// Spawns the listener task and waits for it to have a live `LISTEN` in place before
    /// returning, so that a `Dequeue` call made immediately afterward can't race the listener's
    /// own startup and miss a notification.
    pub async fn new(
        pool: PostgresPool,
        registry: DequeuerRegistry,
        shutdown: GracefulShutdownConsumer,
    ) -> Result<NotificationListener, crate::Error> {
        let (ready_tx, ready_rx) = oneshot::channel();

        let join_handle = tokio::spawn(run(pool, registry, shutdown, ready_tx));

        ready_rx.await.map_err(|_| {
            taskq_database::Error::StringError(
                "notification listener exited before it started listening".to_string(),
            )
        })?;

        Ok(NotificationListener { join_handle })
    }
}

impl Drop for NotificationListener {
    fn drop(&mut self) {
        self.join_handle.abort();
    }
}

#[instrument(skip_all)]
async fn run(
    pool: PostgresPool,
    registry: DequeuerRegistry,
    mut shutdown: GracefulShutdownConsumer,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);

    loop {
        if shutdown.shutting_down() {
            return;
        }

        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                event!(Level::ERROR, error = ?e, "failed to open notification listener connection");
                if wait_or_shutdown(&mut shutdown).await {
                    return;
                }
                continue;
            }
        };

        if let Err(e) = listener.listen(CHANNEL).await {
            event!(Level::ERROR, error = ?e, "failed to LISTEN on tasks channel");
            if wait_or_shutdown(&mut shutdown).await {
                return;
            }
            continue;
        }

        if let Some(tx) = ready.take() {
            // The receiver may already be gone if `NotificationListener::new` timed out and
            // was dropped; that's the caller's problem, not ours.
            let _ = tx.send(());
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for_shutdown() => {
                    let _ = listener.unlisten(CHANNEL).await;
                    return;
                }
                notification = listener.recv() => {
                    match notification {
                        Ok(_) => registry.broadcast(),
                        Err(e) => {
                            event!(Level::ERROR, error = ?e, "notification listener connection lost, reconnecting");
                            break;
                        }
                    }
                }
            }
        }

        if wait_or_shutdown(&mut shutdown).await {
            return;
        }
    }
}

/// Sleeps out the reconnect backoff, racing it against shutdown. Returns `true` if shutdown won.
async fn wait_or_shutdown(shutdown: &mut GracefulShutdownConsumer) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_DELAY) => false,
        _ = shutdown.wait_for_shutdown() => true,
    }
}
