//! Time-based triggers for scheduled tasks.
//!
//! Each enabled task owns one trigger loop. The loop sleeps until the next
//! occurrence of its cron schedule, then enqueues the task's action on the
//! command queue with the system issuer. Lifecycle changes go through the
//! command queue, never straight to a supervisor.

use crate::error::{Error, Result};
use crate::server::Issuer;
use crate::store::Store;
use crate::tasks::types::{
    IntervalSpec, IntervalUnit, JobEvent, JobSpec, NewCommand, ScheduledTask, TaskId, Trigger,
};
use chrono::{DateTime, Local, NaiveTime, Timelike};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Registration {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    schedule: Schedule,
}

/// Registers, replaces and removes trigger loops for scheduled tasks.
pub struct TaskScheduler {
    store: Arc<dyn Store>,
    jobs: Mutex<HashMap<TaskId, Registration>>,
    this: Weak<TaskScheduler>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            store,
            jobs: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Registers every enabled task in the store. Invalid tasks are logged
    /// and skipped. Returns the number of registered tasks.
    pub async fn load_from_store(&self) -> Result<usize> {
        let mut registered = 0;
        for task in self.store.enabled_schedules().await? {
            match self.register(&task) {
                Ok(()) => registered += 1,
                Err(e) => tracing::error!(task_id = task.id, error = %e, "Skipping invalid scheduled task"),
            }
        }
        tracing::info!(count = registered, "Loaded scheduled tasks");
        Ok(registered)
    }

    /// Persists a task and registers its trigger when enabled.
    ///
    /// A trigger that cannot be built removes the persisted record again.
    #[tracing::instrument(skip(self, spec), fields(target_id = %spec.target_id))]
    pub async fn schedule_job(&self, spec: JobSpec) -> Result<ScheduledTask> {
        let task = self.store.create_schedule(spec).await?;

        if task.enabled {
            if let Err(e) = self.register(&task) {
                tracing::error!(task_id = task.id, error = %e, "Rejected scheduled task");
                if let Err(rollback) = self.store.delete_schedule(task.id).await {
                    tracing::error!(task_id = task.id, error = %rollback, "Failed to roll back scheduled task");
                }
                return Err(e);
            }
        }

        tracing::info!(task_id = task.id, action = %task.action, "Scheduled task");
        Ok(task)
    }

    /// Unregisters and deletes a task. A task without a live trigger is fine.
    #[tracing::instrument(skip(self))]
    pub async fn remove_job(&self, id: TaskId) -> Result<()> {
        if !self.unregister(id) {
            tracing::debug!(task_id = id, "No trigger registered, already disabled");
        }
        self.store.delete_schedule(id).await?;
        tracing::info!(task_id = id, "Removed scheduled task");
        Ok(())
    }

    /// Replaces a task's settings and re-registers its trigger.
    ///
    /// On failure the previous settings and trigger are restored.
    #[tracing::instrument(skip(self, spec))]
    pub async fn update_job(&self, id: TaskId, spec: JobSpec) -> Result<ScheduledTask> {
        let previous = self
            .store
            .get_schedule(id)
            .await?
            .ok_or_else(|| Error::Schedule(format!("Scheduled task {} does not exist", id)))?;
        let updated = ScheduledTask::from_spec(id, spec);

        self.unregister(id);
        let result = async {
            self.store.update_schedule(&updated).await?;
            if updated.enabled {
                self.register(&updated)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            tracing::error!(task_id = id, error = %e, "Update rejected, restoring previous task");
            if let Err(restore) = self.store.update_schedule(&previous).await {
                tracing::error!(task_id = id, error = %restore, "Failed to restore scheduled task");
            }
            if previous.enabled {
                if let Err(restore) = self.register(&previous) {
                    tracing::error!(task_id = id, error = %restore, "Failed to re-register scheduled task");
                }
            }
            return Err(e);
        }

        Ok(updated)
    }

    /// Enables or disables a task.
    pub async fn set_enabled(&self, id: TaskId, enabled: bool) -> Result<ScheduledTask> {
        let task = self
            .store
            .get_schedule(id)
            .await?
            .ok_or_else(|| Error::Schedule(format!("Scheduled task {} does not exist", id)))?;
        self.update_job(
            id,
            JobSpec {
                target_id: task.target_id,
                action: task.action,
                trigger: task.trigger,
                enabled,
                one_time: task.one_time,
            },
        )
        .await
    }

    /// Handles the result of one firing. One-time tasks are deleted after
    /// their first successful firing; failures are logged and the task stays.
    pub async fn on_job_fired(&self, event: JobEvent) {
        match event.outcome {
            Ok(command_id) => {
                tracing::debug!(task_id = event.task_id, command_id, "Scheduled task fired");
                let one_time = match self.store.get_schedule(event.task_id).await {
                    Ok(Some(task)) => task.one_time,
                    Ok(None) => false,
                    Err(e) => {
                        tracing::warn!(task_id = event.task_id, error = %e, "Failed to look up fired task");
                        false
                    }
                };
                if one_time {
                    if let Err(e) = self.remove_job(event.task_id).await {
                        tracing::error!(task_id = event.task_id, error = %e, "Failed to delete one-time task");
                    }
                }
            }
            Err(e) => {
                tracing::error!(task_id = event.task_id, error = %e, "Scheduled task failed to fire");
            }
        }
    }

    /// Whether a live trigger exists for the task.
    pub fn is_registered(&self, id: TaskId) -> bool {
        self.jobs
            .lock()
            .map(|jobs| jobs.get(&id).is_some_and(|r| !r.handle.is_finished()))
            .unwrap_or(false)
    }

    /// Ids of every registered task.
    pub fn registered_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .jobs
            .lock()
            .map(|jobs| jobs.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Next `count` firing times of a registered task.
    pub fn upcoming(&self, id: TaskId, count: usize) -> Vec<DateTime<Local>> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| {
                jobs.get(&id)
                    .map(|r| r.schedule.upcoming(Local).take(count).collect())
            })
            .unwrap_or_default()
    }

    /// Stops every trigger loop. Persisted tasks are kept.
    pub fn shutdown(&self) {
        let registrations: Vec<Registration> = match self.jobs.lock() {
            Ok(mut jobs) => jobs.drain().map(|(_, r)| r).collect(),
            Err(_) => Vec::new(),
        };
        for registration in registrations {
            let _ = registration.stop.send(true);
        }
    }

    fn register(&self, task: &ScheduledTask) -> Result<()> {
        let schedule = schedule_for(&task.trigger)?;
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_trigger(
            self.this.clone(),
            task.clone(),
            schedule.clone(),
            stop_rx,
        ));

        let previous = self
            .jobs
            .lock()
            .map_err(|_| Error::Other("Failed to lock scheduler jobs".to_string()))?
            .insert(task.id, Registration { stop, handle, schedule });
        if let Some(previous) = previous {
            let _ = previous.stop.send(true);
        }
        tracing::debug!(task_id = task.id, trigger = ?task.trigger, "Registered trigger");
        Ok(())
    }

    fn unregister(&self, id: TaskId) -> bool {
        let registration = match self.jobs.lock() {
            Ok(mut jobs) => jobs.remove(&id),
            Err(_) => None,
        };
        match registration {
            Some(registration) => {
                let _ = registration.stop.send(true);
                true
            }
            None => false,
        }
    }

    async fn fire(&self, task: &ScheduledTask) {
        tracing::info!(task_id = task.id, target_id = %task.target_id, action = %task.action, "Firing scheduled task");
        let outcome = self
            .store
            .enqueue_command(NewCommand {
                target_id: task.target_id,
                issuer: Issuer::System,
                action: task.action.clone(),
            })
            .await
            .map(|entry| entry.id)
            .map_err(|e| e.to_string());

        self.on_job_fired(JobEvent {
            task_id: task.id,
            outcome,
        })
        .await;
    }
}

async fn run_trigger(
    scheduler: Weak<TaskScheduler>,
    task: ScheduledTask,
    schedule: Schedule,
    mut stop_rx: watch::Receiver<bool>,
) {
    // An occurrence fires at most once, even when the timer wakes early.
    let mut last_fired: Option<DateTime<Local>> = None;
    loop {
        let now = Local::now();
        let from = match last_fired {
            Some(last) if last > now => last,
            _ => now,
        };
        let Some(next) = schedule.after(&from).next() else {
            tracing::debug!(task_id = task.id, "Schedule has no further occurrences");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
            _ = tokio::time::sleep(wait) => {}
        }

        if *stop_rx.borrow() {
            break;
        }
        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        last_fired = Some(next);
        scheduler.fire(&task).await;
    }
    tracing::debug!(task_id = task.id, "Trigger loop stopped");
}

/// Builds the schedule for a trigger.
pub fn schedule_for(trigger: &Trigger) -> Result<Schedule> {
    let expression = cron_expression(trigger)?;
    Schedule::from_str(&expression)
        .map_err(|e| Error::Schedule(format!("Invalid schedule '{}': {}", expression, e)))
}

/// Translates a trigger into a seconds-first cron expression.
///
/// Standard five-field expressions get a leading `0` seconds field and
/// their numeric weekdays moved from Sunday=0 to the Sunday=1 numbering
/// the cron engine uses.
pub fn cron_expression(trigger: &Trigger) -> Result<String> {
    match trigger {
        Trigger::Cron(expression) => {
            let fields: Vec<&str> = expression.split_whitespace().collect();
            match fields.len() {
                5 => Ok(format!(
                    "0 {} {} {} {} {}",
                    fields[0],
                    fields[1],
                    fields[2],
                    fields[3],
                    shift_weekdays(fields[4])?
                )),
                _ => Err(Error::Schedule(format!(
                    "Cron expression '{}' must have five fields",
                    expression
                ))),
            }
        }
        Trigger::Interval(spec) => interval_expression(spec),
    }
}

fn interval_expression(spec: &IntervalSpec) -> Result<String> {
    let every = spec.every;
    let limit = match spec.unit {
        IntervalUnit::Minutes => 59,
        IntervalUnit::Hours => 23,
        IntervalUnit::Days => 31,
    };
    if every == 0 || every > limit {
        return Err(Error::Schedule(format!(
            "Interval of {} {:?} is out of range 1..={}",
            every, spec.unit, limit
        )));
    }

    match spec.unit {
        IntervalUnit::Minutes => Ok(format!("0 */{} * * * *", every)),
        IntervalUnit::Hours => Ok(format!("0 0 */{} * * *", every)),
        IntervalUnit::Days => {
            let at = match spec.at_time.as_deref() {
                Some(time) => NaiveTime::parse_from_str(time, "%H:%M").map_err(|e| {
                    Error::Schedule(format!("Invalid time of day '{}': {}", time, e))
                })?,
                None => NaiveTime::MIN,
            };
            Ok(format!("0 {} {} */{} * *", at.minute(), at.hour(), every))
        }
    }
}

fn shift_weekdays(field: &str) -> Result<String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let step_suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

        let shifted = match range.split_once('-') {
            Some((start, end)) => match (parse_weekday(start)?, parse_weekday(end)?) {
                (Some(start), Some(7)) if start > 0 => {
                    // Sunday at the end of a range wraps to the start of the week.
                    items.push("1".to_string());
                    format!("{}-7", start + 1)
                }
                (Some(start), Some(end)) => format!("{}-{}", to_cron_weekday(start), to_cron_weekday(end)),
                _ => range.to_string(),
            },
            None => match parse_weekday(range)? {
                Some(day) => to_cron_weekday(day).to_string(),
                None => range.to_string(),
            },
        };
        items.push(format!("{}{}", shifted, step_suffix));
    }
    Ok(items.join(","))
}

fn parse_weekday(token: &str) -> Result<Option<u8>> {
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_digit()) {
        return Ok(None);
    }
    match token.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(Some(day)),
        _ => Err(Error::Schedule(format!("Day of week '{}' is out of range 0-7", token))),
    }
}

fn to_cron_weekday(day: u8) -> u8 {
    if day == 7 { 1 } else { day + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cron(expr: &str) -> Result<String> {
        cron_expression(&Trigger::Cron(expr.to_string()))
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        assert_eq!(cron("*/15 * * * *").unwrap(), "0 */15 * * * *");
        assert!(cron("* * * *").is_err());
    }

    #[test]
    fn test_weekday_numbering() {
        assert_eq!(cron("30 4 * * 0").unwrap(), "0 30 4 * * 1");
        assert_eq!(cron("0 9 * * 1-5").unwrap(), "0 0 9 * * 2-6");
        assert_eq!(cron("0 9 * * 5-7").unwrap(), "0 0 9 * * 1,6-7");
        assert_eq!(cron("0 9 * * 0,6").unwrap(), "0 0 9 * * 1,7");
        assert_eq!(cron("0 9 * * MON-FRI").unwrap(), "0 0 9 * * MON-FRI");
        assert_eq!(cron("0 9 * * */2").unwrap(), "0 0 9 * * */2");
        assert!(cron("0 9 * * 8").is_err());
    }

    #[test]
    fn test_interval_rules() {
        let minutes = Trigger::Interval(IntervalSpec { unit: IntervalUnit::Minutes, every: 10, at_time: None });
        let hours = Trigger::Interval(IntervalSpec { unit: IntervalUnit::Hours, every: 6, at_time: None });
        let days = Trigger::Interval(IntervalSpec {
            unit: IntervalUnit::Days,
            every: 2,
            at_time: Some("03:30".to_string()),
        });

        assert_eq!(cron_expression(&minutes).unwrap(), "0 */10 * * * *");
        assert_eq!(cron_expression(&hours).unwrap(), "0 0 */6 * * *");
        assert_eq!(cron_expression(&days).unwrap(), "0 30 3 */2 * *");

        let zero = Trigger::Interval(IntervalSpec { unit: IntervalUnit::Hours, every: 0, at_time: None });
        assert!(cron_expression(&zero).is_err());
        let bad_time = Trigger::Interval(IntervalSpec {
            unit: IntervalUnit::Days,
            every: 1,
            at_time: Some("25:00".to_string()),
        });
        assert!(cron_expression(&bad_time).is_err());
    }

    #[test]
    fn test_every_weekday_schedule_parses() {
        for expr in ["0 9 * * 1-5", "0 9 * * 5-7", "30 4 * * 0", "*/5 * * * *"] {
            assert!(schedule_for(&Trigger::Cron(expr.to_string())).is_ok(), "{expr}");
        }
    }
}
