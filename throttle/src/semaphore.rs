pub struct Semaphore {
    enabled: bool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    /// A value of 0 creates a disabled semaphore which never blocks.
    pub fn new(value: usize) -> Self {
        let value = std::cmp::min(value, tokio::sync::Semaphore::MAX_PERMITS);
        Self {
            enabled: value > 0,
            sem: tokio::sync::Semaphore::new(value),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.enabled {
            return None;
        }
        // the semaphore is never closed so acquire can only succeed
        self.sem.acquire().await.ok()
    }

    pub async fn consume(&self) {
        if !self.enabled {
            return;
        }
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.enabled {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}
