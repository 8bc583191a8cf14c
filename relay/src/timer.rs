use std::time::Duration;

use camlink::Timer;
use tokio::time::Instant;

/// [`Timer`] on the tokio clock of the calling thread's runtime
#[derive(Debug, Clone, Copy)]
pub struct TokioTimer {
    epoch: Instant,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn delay_ms(&mut self, ms: u32) {
        tokio::time::sleep(Duration::from_millis(u64::from(ms))).await
    }
}
