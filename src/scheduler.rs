use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::time::sleep;

use crate::{runner::Runner, types::HarvesterError};

pub const DEFAULT_SCHEDULE: &str = "0 0 0,6,12,18 * * *";

/// Triggers a run every time the cron schedule comes due.
pub struct Scheduler {
    schedule: Schedule,
    runner: Arc<Runner>,
    // how often the termination flag is checked while waiting
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(expression: &str, runner: Arc<Runner>) -> anyhow::Result<Self> {
        let schedule = Schedule::from_str(expression)
            .context(format!("invalid cron expression {:?}", expression))?;
        Ok(Scheduler {
            schedule,
            runner,
            poll_interval: Duration::from_secs(1),
        })
    }

    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }

    /// Loops until `should_terminate` is set. An active run is never interrupted.
    pub async fn run(&self, should_terminate: Arc<AtomicBool>) {
        while !should_terminate.load(Ordering::Relaxed) {
            let Some(next) = self.next_after(&Utc::now()) else {
                warn!("cron schedule has no upcoming times, stopping scheduler");
                return;
            };
            debug!("next scheduled run at {}", next);

            while Utc::now() < next {
                if should_terminate.load(Ordering::Relaxed) {
                    return;
                }
                sleep(self.poll_interval).await;
            }

            info!("scheduled run due at {}", next);
            match self.runner.run_exclusive().await {
                Ok(summary) => info!("scheduled run finished: {}", summary),
                Err(e) => match e.downcast_ref::<HarvesterError>() {
                    Some(HarvesterError::RunInProgress) => {
                        warn!("skipping scheduled run, another run is still active")
                    }
                    _ => error!("scheduled run failed: {:#}", e),
                },
            }
        }
    }
}
