use crate::domain::ports::{ScheduleHandle, ScheduledTask, Scheduler};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// 以 tokio interval 實作的排程器；前一次尚未結束時跳過該次觸發
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for TokioScheduler {
    fn every(&self, interval: Duration, task: ScheduledTask) -> ScheduleHandle {
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        tracing::debug!("⏰ Scheduled task triggered");
                        task().await;
                    }
                }
            }
            tracing::debug!("⏹️ Schedule stopped");
        });

        ScheduleHandle::new(token)
    }
}
