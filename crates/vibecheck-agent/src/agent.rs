//! Inbound message dispatch and single-flight execution.
//!
//! One `Agent` serves one working directory. The execution slot is the sole
//! concurrency-control primitive: interactive queries that find it busy get
//! a canned busy response, scheduled tasks that find it busy wait in a FIFO
//! queue and drain one at a time after each release.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use vibecheck_shared::labels;
use vibecheck_shared::protocol::{
    AgentDef, AgentMessage, ImageData, ScheduledTask, ServerMessage,
};
use vibecheck_shared::skills::{self, Skill};

use crate::config::AgentConfig;
use crate::connection::Outbound;
use crate::executor::{ExecuteError, ExecuteParams, QueryExecutor};
use crate::scheduler::Scheduler;
use crate::security::SecurityMediator;
use crate::session::SessionStore;
use crate::workspace::{self, screenshot};

/// Cap on images attached to one response.
const MAX_IMAGES: usize = 5;

/// The execution slot and the scheduled tasks waiting for it, guarded by one
/// mutex so a release hands the slot to the next queued task with nothing
/// able to observe it free in between.
#[derive(Default)]
struct ExecutionSlot {
    busy: bool,
    queue: VecDeque<ScheduledTask>,
}

impl ExecutionSlot {
    /// Claim the slot for an interactive query; false means it is busy.
    fn try_acquire(slot: &Mutex<Self>) -> bool {
        let mut slot = slot.lock().unwrap();
        if slot.busy {
            return false;
        }
        slot.busy = true;
        true
    }

    /// Claim the slot for a scheduled task, or leave the task in line.
    fn acquire_or_enqueue(slot: &Mutex<Self>, task: ScheduledTask) -> bool {
        let mut slot = slot.lock().unwrap();
        if slot.busy {
            slot.queue.push_back(task);
            return false;
        }
        slot.busy = true;
        true
    }

    /// Hand the slot to the next queued task, or free it when none waits.
    fn release_or_next(slot: &Mutex<Self>) -> Option<ScheduledTask> {
        let mut slot = slot.lock().unwrap();
        match slot.queue.pop_front() {
            Some(task) => Some(task),
            None => {
                slot.busy = false;
                None
            }
        }
    }

    fn is_busy(slot: &Mutex<Self>) -> bool {
        slot.lock().unwrap().busy
    }
}

pub struct Agent {
    config: Arc<AgentConfig>,
    outbound: Outbound,
    store: Arc<SessionStore>,
    security: Arc<SecurityMediator>,
    executor: Arc<QueryExecutor>,
    scheduler: Arc<Scheduler>,
    slot: Mutex<ExecutionSlot>,
}

impl Agent {
    pub fn new(
        config: Arc<AgentConfig>,
        outbound: Outbound,
        store: Arc<SessionStore>,
        security: Arc<SecurityMediator>,
        executor: Arc<QueryExecutor>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            config,
            outbound,
            store,
            security,
            executor,
            scheduler,
            slot: Mutex::new(ExecutionSlot::default()),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The announcement sent once per (re)connection.
    pub fn session_sync_message(&self) -> AgentMessage {
        AgentMessage::SessionSync {
            work_dir: self.config.work_dir_str(),
            session_id: self.store.session_id(),
        }
    }

    /// Decode and route one inbound frame.
    pub async fn handle_frame(self: Arc<Self>, text: &str) {
        let msg = match serde_json::from_str::<ServerMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "undecodable frame dropped");
                return;
            }
        };

        match msg {
            ServerMessage::Query {
                message,
                model,
                skill_id,
                system_prompt,
                agents,
            } => self.handle_query(message, model, skill_id, system_prompt, agents),
            ServerMessage::Approval {
                approved,
                permanent,
            } => self
                .security
                .resolve_approval(approved, permanent.unwrap_or(false)),
            ServerMessage::AddTrustedPath { path } => self.security.add_trusted_path(&path),
            ServerMessage::Interrupt => self.handle_interrupt(),
            ServerMessage::Ping => self.outbound.send(&AgentMessage::Pong),
            ServerMessage::Pong => {}
            ServerMessage::SessionInfo { session_id, source } => {
                self.handle_session_info(session_id, &source)
            }
            ServerMessage::SkillList => self.outbound.send(&AgentMessage::SkillListResponse {
                skills: skills::infos(),
            }),
            ServerMessage::ScheduleAdd {
                cron,
                message,
                skill_id,
            } => self.handle_schedule_add(&cron, &message, skill_id),
            ServerMessage::ScheduleRemove { id } => self.scheduler.remove_task(&id),
            ServerMessage::ScheduleToggle { id, enabled } => {
                self.scheduler.toggle_task(&id, enabled)
            }
            ServerMessage::ScheduleList => {
                self.outbound.send(&AgentMessage::ScheduleListResponse {
                    tasks: self.scheduler.tasks(),
                })
            }
            ServerMessage::Error { message } => warn!(message, "relay reported an error"),
            ServerMessage::Unknown => {}
        }
    }

    fn handle_query(
        self: Arc<Self>,
        message: String,
        model: Option<String>,
        skill_id: Option<String>,
        system_prompt: Option<String>,
        agents: Option<HashMap<String, AgentDef>>,
    ) {
        if !ExecutionSlot::try_acquire(&self.slot) {
            self.outbound.send(&AgentMessage::text_response(labels::BUSY));
            return;
        }

        tokio::spawn(async move {
            let params = ExecuteParams {
                message: message.clone(),
                model,
                skill: resolve_skill(skill_id.as_deref()),
                system_prompt,
                agents,
            };
            self.run_query(&message, params).await;
            self.release_and_drain();
        });
    }

    async fn run_query(&self, user_message: &str, params: ExecuteParams) {
        let before = workspace::snapshot(&self.config.work_dir).await;

        match self.executor.execute(&params).await {
            Err(ExecuteError::Aborted) => {
                // The interrupt handler already sent its response.
                debug!("query aborted, no response emitted here");
            }
            Err(ExecuteError::Sdk(message)) => {
                self.outbound.send(&AgentMessage::text_response(format!(
                    "{}: {}",
                    labels::ERROR_PREFIX,
                    message
                )));
            }
            Ok(result) => {
                let images = self
                    .collect_images(user_message, &result.text, &before)
                    .await;
                self.outbound.send(&AgentMessage::Response {
                    result: result.text,
                    images: if images.is_empty() { None } else { Some(images) },
                    cost_usd: result.cost_usd,
                    num_turns: result.num_turns,
                    usage: result.usage,
                });
            }
        }
    }

    /// Attach up to [`MAX_IMAGES`] images: a screenshot when asked for,
    /// then workspace images created by the query, then (only if nothing was
    /// attached) images the response text points at.
    async fn collect_images(
        &self,
        user_message: &str,
        response_text: &str,
        before: &HashMap<PathBuf, SystemTime>,
    ) -> Vec<ImageData> {
        let mut images = Vec::new();

        if workspace::wants_screenshot(user_message) {
            if let Some(png) = screenshot::capture_workspace(&self.config.work_dir).await {
                images.push(workspace::encode_image("screenshot.png", &png));
            }
        }

        for path in workspace::modified_since(&self.config.work_dir, before).await {
            if images.len() >= MAX_IMAGES {
                break;
            }
            if let Some(image) = workspace::load_image(&path) {
                images.push(image);
            }
        }

        if images.is_empty() {
            for path in workspace::extract_image_paths(response_text, &self.config.work_dir) {
                if images.len() >= MAX_IMAGES {
                    break;
                }
                if let Some(image) = workspace::load_image(&path) {
                    images.push(image);
                }
            }
        }

        images
    }

    fn handle_interrupt(&self) {
        if !ExecutionSlot::is_busy(&self.slot) {
            return;
        }
        if self.executor.interrupt() {
            self.outbound
                .send(&AgentMessage::text_response(labels::INTERRUPTED));
        }
    }

    fn handle_session_info(&self, session_id: Option<String>, source: &str) {
        if source != "server" {
            return;
        }
        let Some(session_id) = session_id else {
            return;
        };
        if self.store.adopt_if_absent(&session_id) {
            info!(session_id = %session_id, "adopted session id from server");
        }
    }

    fn handle_schedule_add(&self, cron: &str, message: &str, skill_id: Option<String>) {
        let response = match self.scheduler.add_task(cron, message, skill_id) {
            Ok(task) => AgentMessage::ScheduleAddResponse {
                success: true,
                task: Some(task),
                error: None,
            },
            Err(error) => AgentMessage::ScheduleAddResponse {
                success: false,
                task: None,
                error: Some(error),
            },
        };
        self.outbound.send(&response);
    }

    /// Entry point for cron firings: run now or wait in line.
    pub async fn run_scheduled(self: Arc<Self>, task: ScheduledTask) {
        if !ExecutionSlot::acquire_or_enqueue(&self.slot, task.clone()) {
            debug!(id = %task.id, "execution slot busy, task queued");
            return;
        }
        self.run_scheduled_now(task).await;
    }

    /// Run one scheduled task with the execution slot already held.
    async fn run_scheduled_now(self: Arc<Self>, task: ScheduledTask) {
        let params = ExecuteParams {
            message: task.message.clone(),
            model: None,
            skill: resolve_skill(task.skill_id.as_deref()),
            system_prompt: None,
            agents: None,
        };

        match self.executor.execute(&params).await {
            Err(ExecuteError::Aborted) => {
                debug!(id = %task.id, "scheduled task aborted mid-flight");
            }
            Err(ExecuteError::Sdk(message)) => {
                let text = format!("{}: {}", labels::ERROR_PREFIX, message);
                self.scheduler.record_result(&task.id, &text);
                self.outbound.send(&AgentMessage::text_response(format!(
                    "{} [{}] {}",
                    labels::SCHEDULED_PREFIX,
                    task.cron,
                    text
                )));
            }
            Ok(result) => {
                self.scheduler.record_result(&task.id, &result.text);
                self.outbound.send(&AgentMessage::Response {
                    result: format!(
                        "{} [{}] {}",
                        labels::SCHEDULED_PREFIX,
                        task.cron,
                        result.text
                    ),
                    images: None,
                    cost_usd: result.cost_usd,
                    num_turns: result.num_turns,
                    usage: result.usage,
                });
            }
        }

        self.release_and_drain();
    }

    /// Hand the slot to at most one queued task, or free it. The hand-off
    /// happens under the slot lock, so no query can claim the slot ahead of
    /// a task that was already waiting.
    fn release_and_drain(self: Arc<Self>) {
        if let Some(task) = ExecutionSlot::release_or_next(&self.slot) {
            tokio::spawn(async move {
                self.run_scheduled_now(task).await;
            });
        }
    }
}

fn resolve_skill(skill_id: Option<&str>) -> Option<&'static Skill> {
    let id = skill_id?;
    let skill = skills::find(id);
    if skill.is_none() {
        warn!(skill_id = id, "unknown skill id, running without a preset");
    }
    skill
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_skill_falls_back_to_none() {
        assert!(resolve_skill(Some("nope")).is_none());
        assert!(resolve_skill(None).is_none());
        assert!(resolve_skill(Some("docs")).is_some());
    }

    fn task(id: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            cron: "* * * * *".into(),
            message: "ping".into(),
            skill_id: None,
            enabled: true,
            created_at: "2025-01-01T00:00:00Z".into(),
            last_run: None,
            last_result: None,
        }
    }

    #[test]
    fn slot_hands_off_to_queued_task_before_freeing() {
        let slot = Mutex::new(ExecutionSlot::default());
        assert!(ExecutionSlot::try_acquire(&slot));
        assert!(!ExecutionSlot::try_acquire(&slot));
        assert!(!ExecutionSlot::acquire_or_enqueue(&slot, task("t1")));

        // Release hands the slot straight to the queued task; a query
        // arriving now must still see it busy.
        let next = ExecutionSlot::release_or_next(&slot).unwrap();
        assert_eq!(next.id, "t1");
        assert!(ExecutionSlot::is_busy(&slot));
        assert!(!ExecutionSlot::try_acquire(&slot));

        // With the queue empty the release frees the slot.
        assert!(ExecutionSlot::release_or_next(&slot).is_none());
        assert!(!ExecutionSlot::is_busy(&slot));
        assert!(ExecutionSlot::try_acquire(&slot));
    }

    #[test]
    fn slot_queue_preserves_fifo_order() {
        let slot = Mutex::new(ExecutionSlot::default());
        assert!(ExecutionSlot::try_acquire(&slot));
        assert!(!ExecutionSlot::acquire_or_enqueue(&slot, task("a")));
        assert!(!ExecutionSlot::acquire_or_enqueue(&slot, task("b")));

        assert_eq!(ExecutionSlot::release_or_next(&slot).unwrap().id, "a");
        assert_eq!(ExecutionSlot::release_or_next(&slot).unwrap().id, "b");
        assert!(ExecutionSlot::release_or_next(&slot).is_none());
    }
}
