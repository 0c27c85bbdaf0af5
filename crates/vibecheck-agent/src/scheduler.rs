//! Cron-scheduled prompts.
//!
//! Tasks are persisted as a JSON array and re-armed on startup. Each enabled
//! task runs on its own timer; firing updates `last_run`, persists, and hands
//! the task to the agent, which either runs it or queues it behind the
//! in-flight query.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Local;
use cron::Schedule;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vibecheck_shared::protocol::ScheduledTask;

/// Validate a 5-field cron expression.
///
/// The parser works on 6-field expressions (leading seconds), so a zero
/// seconds field is prepended; the stored string stays 5-field.
pub fn validate_cron(expr: &str) -> Result<(), String> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(format!(
            "cron expression must have 5 fields, got {fields}: \"{expr}\""
        ));
    }
    Schedule::from_str(&format!("0 {expr}"))
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression \"{expr}\": {e}"))
}

pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    file: PathBuf,
    tasks: Mutex<Vec<ScheduledTask>>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    fire_tx: mpsc::UnboundedSender<ScheduledTask>,
}

impl Scheduler {
    /// Load the persisted task list and arm every enabled task.
    pub fn new(file: PathBuf, fire_tx: mpsc::UnboundedSender<ScheduledTask>) -> Self {
        let tasks = load_tasks(&file);
        let inner = Arc::new(Inner {
            file,
            tasks: Mutex::new(tasks),
            jobs: Mutex::new(HashMap::new()),
            fire_tx,
        });

        let to_arm: Vec<ScheduledTask> = inner
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.enabled)
            .cloned()
            .collect();
        for task in to_arm {
            info!(id = %task.id, cron = %task.cron, "re-armed scheduled task");
            Inner::arm(&inner, &task);
        }

        Self { inner }
    }

    /// Insert a task; rejects invalid cron expressions.
    pub fn add_task(
        &self,
        cron: &str,
        message: &str,
        skill_id: Option<String>,
    ) -> Result<ScheduledTask, String> {
        validate_cron(cron)?;

        let task = ScheduledTask {
            id: format!("task_{}", chrono::Utc::now().timestamp_millis()),
            cron: cron.to_string(),
            message: message.to_string(),
            skill_id,
            enabled: true,
            created_at: chrono::Utc::now().to_rfc3339(),
            last_run: None,
            last_result: None,
        };

        self.inner.tasks.lock().unwrap().push(task.clone());
        self.inner.persist();
        Inner::arm(&self.inner, &task);
        info!(id = %task.id, cron = %task.cron, "scheduled task added");
        Ok(task)
    }

    pub fn remove_task(&self, id: &str) {
        if let Some(job) = self.inner.jobs.lock().unwrap().remove(id) {
            job.abort();
        }
        self.inner.tasks.lock().unwrap().retain(|t| t.id != id);
        self.inner.persist();
        debug!(id, "scheduled task removed");
    }

    pub fn toggle_task(&self, id: &str, enabled: bool) {
        let task = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
                return;
            };
            task.enabled = enabled;
            task.clone()
        };
        self.inner.persist();

        if let Some(job) = self.inner.jobs.lock().unwrap().remove(id) {
            job.abort();
        }
        if enabled {
            Inner::arm(&self.inner, &task);
        }
        debug!(id, enabled, "scheduled task toggled");
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.inner.tasks.lock().unwrap().clone()
    }

    /// Store the (truncated) result of a completed firing.
    pub fn record_result(&self, id: &str, result: &str) {
        {
            let mut tasks = self.inner.tasks.lock().unwrap();
            let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
                return;
            };
            task.last_result = Some(result.chars().take(200).collect());
        }
        self.inner.persist();
    }

    #[cfg(test)]
    fn armed_job_count(&self) -> usize {
        self.inner.jobs.lock().unwrap().len()
    }
}

impl Inner {
    /// Spawn the timer loop for one task.
    fn arm(inner: &Arc<Inner>, task: &ScheduledTask) {
        let schedule = match Schedule::from_str(&format!("0 {}", task.cron)) {
            Ok(s) => s,
            Err(e) => {
                // Persisted tasks are validated at insertion; a parse failure
                // here means the file was edited by hand.
                warn!(id = %task.id, error = %e, "stored cron no longer parses, task not armed");
                return;
            }
        };

        let id = task.id.clone();
        let inner_ref = inner.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Local).next() else {
                    break;
                };
                let wait = (next - Local::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));
                tokio::time::sleep(wait).await;

                let Some(task) = inner_ref.touch_last_run(&id) else {
                    break;
                };
                debug!(id = %task.id, "scheduled task fired");
                if inner_ref.fire_tx.send(task).is_err() {
                    break;
                }
            }
        });

        inner.jobs.lock().unwrap().insert(task.id.clone(), handle);
    }

    /// Stamp `last_run` and persist; returns the task when it is still
    /// present and enabled.
    fn touch_last_run(&self, id: &str) -> Option<ScheduledTask> {
        let task = {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks.iter_mut().find(|t| t.id == id)?;
            if !task.enabled {
                return None;
            }
            task.last_run = Some(chrono::Utc::now().to_rfc3339());
            task.clone()
        };
        self.persist();
        Some(task)
    }

    fn persist(&self) {
        let tasks = self.tasks.lock().unwrap().clone();
        let content = match serde_json::to_string_pretty(&tasks) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "cannot serialize schedule file");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.file, content) {
            warn!(error = %e, path = %self.file.display(), "cannot write schedule file");
        }
    }
}

fn load_tasks(file: &Path) -> Vec<ScheduledTask> {
    if !file.exists() {
        return Vec::new();
    }
    match std::fs::read_to_string(file) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "schedule file is corrupt, starting empty");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(error = %e, "cannot read schedule file");
            Vec::new()
        }
    }
}
