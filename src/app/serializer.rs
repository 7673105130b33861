use std::future::Future;

use tokio::sync::Mutex;

/// FIFO gate for operations that share the primary page.
///
/// The tokio mutex hands out the lock in request order, so queued operations
/// run strictly one after another in submission order. The turn is released
/// whether the operation succeeds, fails or panics.
#[derive(Default)]
pub struct NavigationQueue {
    turn: Mutex<()>,
}

impl NavigationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _turn = self.turn.lock().await;
        operation.await
    }
}
