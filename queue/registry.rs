use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Process-local fan-out from the notification listener to every task currently blocked in
/// `Dequeue`. Each registered waiter gets a capacity-1 channel: a wake-up that arrives while one
/// is already pending is dropped rather than queued, since all a waiter ever does with it is
/// "go look at the database again".
#[derive(Clone)]
pub(crate) struct DequeuerRegistry(Arc<Mutex<Inner>>);

struct Inner {
    next_id: u64,
    waiters: Vec<(u64, mpsc::Sender<()>)>,
}

pub(crate) struct Registration {
    id: u64,
    registry: DequeuerRegistry,
}

impl DequeuerRegistry {
    pub fn new() -> DequeuerRegistry {
        DequeuerRegistry(Arc::new(Mutex::new(Inner {
            next_id: 0,
            waiters: Vec::new(),
        })))
    }

    pub fn register(&self) -> (Registration, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.0.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiters.push((id, tx));
        (
            Registration {
                id,
                registry: self.clone(),
            },
            rx,
        )
    }

    fn unregister(&self, id: u64) {
        let mut inner = self.0.lock().unwrap();
        inner.waiters.retain(|(waiter_id, _)| *waiter_id != id);
    }

    /// Wake every registered waiter. Non-blocking: a waiter that isn't polling right now, or
    /// already has a wake-up queued, just misses this one and picks it up on its next pass.
    pub fn broadcast(&self) {
        let inner = self.0.lock().unwrap();
        for (_, tx) in inner.waiters.iter() {
            let _ = tx.try_send(());
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
