use tokio::sync::Semaphore;

/// Count-down latch over a semaphore: `count_down` releases one permit,
/// `wait` resolves once all expected permits are in.
///
/// The latch stays open after the count reaches zero, so `wait` may be
/// called more than once.
pub(crate) struct CountdownLatch {
    count: u32,
    sem: Semaphore,
}

impl CountdownLatch {
    pub(crate) fn new(count: u32) -> Self {
        Self {
            count,
            sem: Semaphore::new(0),
        }
    }

    pub(crate) fn count_down(&self) {
        self.sem.add_permits(1);
    }

    pub(crate) async fn wait(&self) {
        // The semaphore is never closed, so acquisition cannot fail;
        // dropping the permit re-opens the latch for other waiters.
        let _ = self.sem.acquire_many(self.count).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn waits_for_every_count() {
        let latch = Arc::new(CountdownLatch::new(2));

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        latch.count_down();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        latch.count_down();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("latch should open")
            .expect("waiter should not panic");
    }

    #[tokio::test]
    async fn zero_count_is_already_open() {
        let latch = CountdownLatch::new(0);
        latch.wait().await;
    }

    #[tokio::test]
    async fn stays_open_for_repeat_waits() {
        let latch = CountdownLatch::new(1);
        latch.count_down();
        latch.wait().await;
        latch.wait().await;
    }
}
