use chrono::{DateTime, Utc};
use palaver_core::config::{Schedule, ScheduleConfig};
use palaver_core::{CommandSink, IpcCommand, Trigger};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::schedule::compute_next_run;

/// One configured schedule and its runtime state.
#[derive(Debug, Clone)]
pub struct ScheduledCommand {
    pub command: String,
    pub schedule: Schedule,
    pub payload: Value,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u32,
}

impl ScheduledCommand {
    fn from_config(config: &ScheduleConfig, now: DateTime<Utc>) -> Self {
        Self {
            command: config.command.clone(),
            schedule: config.schedule.clone(),
            payload: config.payload.clone(),
            next_run: compute_next_run(&config.schedule, now),
            run_count: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_run.is_none()
    }
}

/// Fires `[[schedules]]` entries as IPC commands at ±1 s precision.
///
/// Fired commands go through the [`CommandSink`], which never blocks the
/// tick loop; a full queue drops that firing with a warning.
pub struct ScheduleEngine {
    jobs: Vec<ScheduledCommand>,
    sink: CommandSink,
}

impl ScheduleEngine {
    pub fn new(schedules: &[ScheduleConfig], sink: CommandSink) -> Self {
        Self::starting_at(schedules, sink, Utc::now())
    }

    pub fn starting_at(schedules: &[ScheduleConfig], sink: CommandSink, now: DateTime<Utc>) -> Self {
        let jobs: Vec<ScheduledCommand> = schedules
            .iter()
            .map(|c| ScheduledCommand::from_config(c, now))
            .collect();

        let missed = jobs.iter().filter(|j| j.is_exhausted()).count();
        if missed > 0 {
            warn!(count = missed, "schedules with no future run at startup");
        }
        Self { jobs, sink }
    }

    pub fn jobs(&self) -> &[ScheduledCommand] {
        &self.jobs
    }

    /// Main event loop. Polls every second until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(jobs = self.jobs.len(), "schedule engine started");

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("schedule engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Fire every job whose next run has arrived. Returns how many fired.
    pub fn tick(&mut self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for job in &mut self.jobs {
            let due = job.next_run.is_some_and(|at| at <= now);
            if !due {
                continue;
            }

            job.run_count += 1;
            job.next_run = compute_next_run(&job.schedule, now);
            info!(
                command = %job.command,
                run = job.run_count,
                next_run = ?job.next_run,
                "firing scheduled command"
            );

            let command = IpcCommand::new(job.command.clone(), job.payload.clone(), Trigger::Scheduled);
            if self.sink.enqueue(command) {
                fired += 1;
            }
        }
        if fired > 0 {
            debug!(fired, "schedule tick");
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).single().unwrap()
    }

    fn entry(command: &str, schedule: Schedule) -> ScheduleConfig {
        ScheduleConfig {
            command: command.to_string(),
            schedule,
            payload: json!({"from": command}),
        }
    }

    #[tokio::test]
    async fn due_jobs_fire_as_scheduled_commands() {
        let (sink, mut rx) = CommandSink::channel(8);
        let start = at(12, 0, 0);
        let mut engine = ScheduleEngine::starting_at(
            &[
                entry("every_minute", Schedule::Interval { every_secs: 60 }),
                entry("later", Schedule::Once { at: at(13, 0, 0) }),
            ],
            sink,
            start,
        );

        assert_eq!(engine.tick(start + Duration::seconds(30)), 0);
        assert_eq!(engine.tick(start + Duration::seconds(60)), 1);

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired.name, "every_minute");
        assert_eq!(fired.trigger, Trigger::Scheduled);
        assert_eq!(fired.payload, json!({"from": "every_minute"}));
        assert!(fired.conversation.is_none());
    }

    #[tokio::test]
    async fn once_schedule_is_exhausted_after_firing() {
        let (sink, _rx) = CommandSink::channel(8);
        let mut engine = ScheduleEngine::starting_at(
            &[entry("once", Schedule::Once { at: at(12, 0, 5) })],
            sink,
            at(12, 0, 0),
        );

        assert_eq!(engine.tick(at(12, 0, 5)), 1);
        assert!(engine.jobs()[0].is_exhausted());
        assert_eq!(engine.jobs()[0].run_count, 1);
        assert_eq!(engine.tick(at(12, 0, 10)), 0);
    }

    #[test]
    fn past_once_never_fires() {
        let (sink, _rx) = CommandSink::channel(8);
        let mut engine = ScheduleEngine::starting_at(
            &[entry("stale", Schedule::Once { at: at(11, 0, 0) })],
            sink,
            at(12, 0, 0),
        );
        assert!(engine.jobs()[0].is_exhausted());
        assert_eq!(engine.tick(at(12, 0, 1)), 0);
    }

    #[test]
    fn full_queue_drops_firing_but_advances() {
        let (sink, _rx) = CommandSink::channel(1);
        let start = at(12, 0, 0);
        let mut engine = ScheduleEngine::starting_at(
            &[
                entry("a", Schedule::Interval { every_secs: 1 }),
                entry("b", Schedule::Interval { every_secs: 1 }),
            ],
            sink,
            start,
        );

        assert_eq!(engine.tick(start + Duration::seconds(1)), 1);
        assert!(engine.jobs().iter().all(|j| j.run_count == 1));
        assert!(engine.jobs().iter().all(|j| j.next_run == Some(start + Duration::seconds(2))));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (sink, _rx) = CommandSink::channel(1);
        let engine = ScheduleEngine::new(&[], sink);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
