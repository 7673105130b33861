use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::browser::BrowserPage;

/// A page checked out of the pool. Holds one concurrency permit until released.
pub struct PooledPage {
    page: Box<dyn BrowserPage>,
    generation: u64,
    _permit: OwnedSemaphorePermit,
}

impl PooledPage {
    pub fn page(&mut self) -> &mut dyn BrowserPage {
        self.page.as_mut()
    }
}

struct IdlePage {
    page: Box<dyn BrowserPage>,
    generation: u64,
}

/// Bounded set of warm pages. Pages are tagged with the login generation whose
/// cookies they carry and are closed instead of reused once that login is stale.
pub struct PagePool {
    idle: Mutex<Vec<IdlePage>>,
    permits: Arc<Semaphore>,
    max_pages: usize,
}

impl PagePool {
    pub fn new(max_pages: usize) -> Self {
        let max_pages = max_pages.max(1);
        Self {
            idle: Mutex::new(Vec::with_capacity(max_pages)),
            permits: Arc::new(Semaphore::new(max_pages)),
            max_pages,
        }
    }

    #[cfg(test)]
    pub async fn idle_len(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// Waits until fewer than `max_pages` pages are checked out.
    pub async fn permit(&self) -> OwnedSemaphorePermit {
        loop {
            match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => return permit,
                // never closed; keep waiting rather than exceed the cap
                Err(_) => tokio::task::yield_now().await,
            }
        }
    }

    /// Pops a warm page of `generation`. Stale pages found on the way are closed.
    pub async fn take(
        &self,
        generation: u64,
        permit: OwnedSemaphorePermit,
    ) -> Result<PooledPage, OwnedSemaphorePermit> {
        let mut stale = Vec::new();
        let found = {
            let mut idle = self.idle.lock().await;
            let mut found = None;
            while let Some(entry) = idle.pop() {
                if entry.generation == generation {
                    found = Some(entry);
                    break;
                }
                stale.push(entry);
            }
            found
        };
        for mut entry in stale {
            entry.page.close().await;
        }
        match found {
            Some(entry) => Ok(PooledPage {
                page: entry.page,
                generation: entry.generation,
                _permit: permit,
            }),
            None => Err(permit),
        }
    }

    pub fn wrap(
        &self,
        page: Box<dyn BrowserPage>,
        generation: u64,
        permit: OwnedSemaphorePermit,
    ) -> PooledPage {
        PooledPage {
            page,
            generation,
            _permit: permit,
        }
    }

    /// Returns a page to the pool, or closes it when the pool is full or the
    /// page belongs to an older login.
    pub async fn release(&self, pooled: PooledPage, current_generation: u64) {
        let PooledPage {
            mut page,
            generation,
            _permit,
        } = pooled;
        if generation == current_generation {
            let mut idle = self.idle.lock().await;
            if idle.len() < self.max_pages {
                idle.push(IdlePage { page, generation });
                return;
            }
        } else {
            debug!(generation, current_generation, "closing page from stale login");
        }
        page.close().await;
    }

    /// Closes and forgets every idle page.
    pub async fn close_all(&self) {
        let drained = std::mem::take(&mut *self.idle.lock().await);
        for mut entry in drained {
            entry.page.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::browser::Browser;
    use crate::app::testing::FixtureSite;

    #[tokio::test]
    async fn release_beyond_cap_closes_the_page() {
        let site = FixtureSite::new("u", "p");
        let browser = site.browser();
        let pool = PagePool::new(1);

        let p1 = pool.permit().await;
        let a = pool.wrap(browser.new_page("ua").await.unwrap(), 1, p1);
        pool.release(a, 1).await;
        assert_eq!(pool.idle_len().await, 1);

        let p2 = pool.permit().await;
        let b = pool.wrap(browser.new_page("ua").await.unwrap(), 1, p2);
        pool.release(b, 1).await;
        assert_eq!(pool.idle_len().await, 1);
        assert_eq!(site.pages_closed(), 1);
    }

    #[tokio::test]
    async fn stale_generation_pages_are_not_reused() {
        let site = FixtureSite::new("u", "p");
        let browser = site.browser();
        let pool = PagePool::new(4);

        let permit = pool.permit().await;
        let page = pool.wrap(browser.new_page("ua").await.unwrap(), 1, permit);
        pool.release(page, 1).await;

        let permit = pool.permit().await;
        assert!(pool.take(2, permit).await.is_err());
        assert_eq!(pool.idle_len().await, 0);
        assert_eq!(site.pages_closed(), 1);
    }

    #[tokio::test]
    async fn warm_page_is_reused_for_same_generation() {
        let site = FixtureSite::new("u", "p");
        let browser = site.browser();
        let pool = PagePool::new(4);

        let permit = pool.permit().await;
        let page = pool.wrap(browser.new_page("ua").await.unwrap(), 3, permit);
        pool.release(page, 3).await;

        let permit = pool.permit().await;
        let reused = pool.take(3, permit).await;
        assert!(reused.is_ok());
        assert_eq!(site.pages_created(), 1);
    }

    #[tokio::test]
    async fn permits_bound_checked_out_pages() {
        let pool = PagePool::new(2);
        let a = pool.permit().await;
        let _b = pool.permit().await;
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), pool.permit()).await;
        assert!(third.is_err());
        drop(a);
        let third = tokio::time::timeout(std::time::Duration::from_millis(50), pool.permit()).await;
        assert!(third.is_ok());
    }
}
