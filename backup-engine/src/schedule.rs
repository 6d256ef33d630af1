//! Scheduled triggers for the engine.
//!
//! Each backup trigger has an interval in minutes and a time-of-day anchor
//! (`HH:MM`, UTC). Intervals that divide a day evenly become cron
//! expressions aligned to the anchor; anything else repeats every interval
//! from scheduler start. Trigger bodies run on the blocking pool.

use crate::orchestrator::{BackupEngine, Trigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};

const MINUTES_PER_DAY: u64 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerSchedule {
    /// Six-field cron expression (seconds first)
    Cron(String),
    Every(Duration),
    Disabled,
}

/// Translate an interval and anchor into a schedule.
pub fn trigger_schedule(interval_minutes: u64, anchor: &str) -> TriggerSchedule {
    if interval_minutes == 0 {
        return TriggerSchedule::Disabled;
    }
    let every = TriggerSchedule::Every(Duration::from_secs(interval_minutes * 60));

    let Some((hour, minute)) = parse_anchor(anchor) else {
        return every;
    };

    if interval_minutes == MINUTES_PER_DAY {
        return TriggerSchedule::Cron(format!("0 {minute} {hour} * * *"));
    }

    if MINUTES_PER_DAY % interval_minutes == 0 && interval_minutes % 60 == 0 {
        let step = interval_minutes / 60;
        let hours = if step == 1 {
            "*".to_string()
        } else {
            aligned_list(hour as u64, step, 24)
        };
        return TriggerSchedule::Cron(format!("0 {minute} {hours} * * *"));
    }

    if interval_minutes < 60 && 60 % interval_minutes == 0 {
        let minutes = aligned_list(minute as u64, interval_minutes, 60);
        return TriggerSchedule::Cron(format!("0 {minutes} * * * *"));
    }

    every
}

/// `start`, `start + step`, … modulo `modulus`, sorted and comma-joined.
fn aligned_list(start: u64, step: u64, modulus: u64) -> String {
    let mut values: Vec<u64> = (0..modulus / step).map(|i| (start + i * step) % modulus).collect();
    values.sort_unstable();
    values
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_anchor(anchor: &str) -> Option<(u32, u32)> {
    let (h, m) = anchor.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

pub struct EngineScheduler {
    scheduler: Mutex<JobScheduler>,
    engine: Arc<BackupEngine>,
}

impl EngineScheduler {
    pub async fn new(engine: Arc<BackupEngine>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            engine,
        })
    }

    /// Add one trigger. Returns false when the schedule is disabled.
    pub async fn schedule_trigger(&self, trigger: Trigger, schedule: TriggerSchedule) -> anyhow::Result<bool> {
        let job = match &schedule {
            TriggerSchedule::Disabled => {
                tracing::info!(trigger = %trigger, "Trigger disabled");
                return Ok(false);
            }
            TriggerSchedule::Cron(expr) => {
                let engine = self.engine.clone();
                Job::new_async(expr.as_str(), move |_uuid, _lock| {
                    let engine = engine.clone();
                    Box::pin(async move { fire(engine, trigger).await })
                })?
            }
            TriggerSchedule::Every(every) => {
                let engine = self.engine.clone();
                Job::new_repeated_async(*every, move |_uuid, _lock| {
                    let engine = engine.clone();
                    Box::pin(async move { fire(engine, trigger).await })
                })?
            }
        };

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(trigger = %trigger, schedule = ?schedule, "Trigger scheduled");
        Ok(true)
    }

    /// Schedule every trigger from the engine's configuration.
    pub async fn init_schedules(&self) -> anyhow::Result<usize> {
        let config = self.engine.config().schedule.clone();
        let mut triggers = vec![
            (
                Trigger::FullBackup,
                trigger_schedule(config.full_interval_minutes, &config.full_time),
            ),
            (
                Trigger::IncrementalBackup,
                trigger_schedule(config.incremental_interval_minutes, &config.incremental_time),
            ),
            (
                Trigger::Validation,
                trigger_schedule(config.validation_interval_minutes, ""),
            ),
        ];
        if self.engine.replication().is_enabled() {
            triggers.push((
                Trigger::Replication,
                trigger_schedule(config.replication_interval_minutes, ""),
            ));
        }

        let mut count = 0;
        for (trigger, schedule) in triggers {
            match self.schedule_trigger(trigger, schedule).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(trigger = %trigger, error = %e, "Failed to schedule trigger"),
            }
        }

        tracing::info!(count, "Engine schedules initialized");
        Ok(count)
    }

    /// Start firing triggers. Pending replications are swept once right away.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;

        if self.engine.replication().is_enabled() {
            tokio::spawn(fire(self.engine.clone(), Trigger::Replication));
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        tracing::info!("Engine scheduler stopped");
        Ok(())
    }
}

async fn fire(engine: Arc<BackupEngine>, trigger: Trigger) {
    match tokio::task::spawn_blocking(move || engine.run_trigger(trigger)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(trigger = %trigger, error = %e, "Scheduled trigger failed"),
        Err(e) => tracing::error!(trigger = %trigger, error = %e, "Scheduled trigger panicked"),
    }
}
