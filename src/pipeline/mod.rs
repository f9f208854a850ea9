// src/pipeline/mod.rs
//
// Stage wiring. Every robot gets its own intake -> tracker -> decision
// chain connected by bounded channels; a single state-machine task owns
// all sessions and cases and fans events out to the case-log adapter, the
// GUI channel and the robot command link. Components never share mutable
// state; they only hand messages forward, so one stalled or lost session
// cannot corrupt another.

pub mod event_bus;
pub mod metrics;

use crate::codec::{CaseRecord, DetectionResult};
use crate::decision::{DecisionEngine, DecisionEvent};
use crate::error::PipelineError;
use crate::intake::DejitterQueue;
use crate::session::{OperatorCommand, RobotCommand, StateMachine};
use crate::tracker::ObjectTracker;
use crate::types::{Config, Label, Location, RobotStatus, SmoothedDetection};
use chrono::{DateTime, Utc};
use event_bus::PipelineEvent;
use metrics::PipelineMetrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Everything the state machine consumes, from any source.
#[derive(Debug)]
pub enum StateInput {
    Decision {
        robot_id: String,
        event: DecisionEvent,
    },
    Telemetry {
        robot_id: String,
        status: RobotStatus,
        location: Location,
    },
    Command(OperatorCommand),
    SessionLost {
        robot_id: String,
    },
    DeliveryFailed {
        robot_id: String,
        command: RobotCommand,
    },
}

/// One frame tick leaving the tracker stage.
#[derive(Debug)]
struct TrackedFrame {
    frame_id: u64,
    timestamp: DateTime<Utc>,
    smoothed: Vec<SmoothedDetection>,
}

/// Hysteresis feedback senders (operator case closures routed back to each
/// robot's decision engine), keyed by robot id.
pub type FeedbackRegistry = Arc<Mutex<HashMap<String, mpsc::Sender<Label>>>>;

/// Handle to one robot's stage chain.
pub struct RobotPipeline {
    pub frame_tx: mpsc::Sender<DetectionResult>,
    tasks: Vec<JoinHandle<()>>,
}

impl RobotPipeline {
    /// Tear the stages down, dropping any queued frames. Case closure for
    /// the lost session is the state machine's job, not ours.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Spawn the intake -> tracker -> decision chain for one robot.
pub fn spawn_robot_pipeline(
    robot_id: &str,
    config: &Config,
    metrics: PipelineMetrics,
    state_tx: mpsc::Sender<StateInput>,
    feedback: &FeedbackRegistry,
) -> RobotPipeline {
    let capacity = config.server.channel_capacity.max(1);
    let (frame_tx, frame_rx) = mpsc::channel::<DetectionResult>(capacity);
    let (tracked_in_tx, tracked_in_rx) = mpsc::channel::<DetectionResult>(capacity);
    let (smoothed_tx, smoothed_rx) = mpsc::channel::<TrackedFrame>(capacity);
    let (ctrl_tx, ctrl_rx) = mpsc::channel::<Label>(capacity);

    feedback
        .lock()
        .expect("feedback registry poisoned")
        .insert(robot_id.to_string(), ctrl_tx);

    let intake = tokio::spawn(run_intake(
        robot_id.to_string(),
        config.intake.clone(),
        frame_rx,
        tracked_in_tx,
        metrics.clone(),
    ));
    let tracker = tokio::spawn(run_tracker(
        config.clone(),
        tracked_in_rx,
        smoothed_tx,
        metrics.clone(),
    ));
    let decision = tokio::spawn(run_decision(
        robot_id.to_string(),
        config.clone(),
        smoothed_rx,
        ctrl_rx,
        state_tx,
    ));

    info!(robot_id, "robot pipeline started");
    RobotPipeline {
        frame_tx,
        tasks: vec![intake, tracker, decision],
    }
}

async fn run_intake(
    robot_id: String,
    config: crate::types::IntakeConfig,
    mut frame_rx: mpsc::Receiver<DetectionResult>,
    out_tx: mpsc::Sender<DetectionResult>,
    metrics: PipelineMetrics,
) {
    let mut queue = DejitterQueue::new(&config);
    let mut evicted_seen = 0u64;

    while let Some(frame) = frame_rx.recv().await {
        metrics.inc(&metrics.frames_received);
        if let Err(e @ PipelineError::StaleFrame { .. }) = queue.push(frame, Utc::now()) {
            metrics.inc(&metrics.stale_frames);
            debug!(robot_id, "{e}");
        }
        let evicted = queue.evicted();
        if evicted > evicted_seen {
            metrics.add(&metrics.evicted_frames, evicted - evicted_seen);
            evicted_seen = evicted;
        }
        while let Some(admitted) = queue.pop() {
            metrics.inc(&metrics.frames_dispatched);
            if out_tx.send(admitted).await.is_err() {
                return;
            }
        }
    }
    debug!(robot_id, "intake stage draining: source channel closed");
}

async fn run_tracker(
    config: Config,
    mut in_rx: mpsc::Receiver<DetectionResult>,
    out_tx: mpsc::Sender<TrackedFrame>,
    metrics: PipelineMetrics,
) {
    let mut tracker = ObjectTracker::new(config.tracker.clone());
    let mut created_seen = 0u64;

    while let Some(frame) = in_rx.recv().await {
        let smoothed = tracker.observe(&frame);
        let created = tracker.tracks_created();
        if created > created_seen {
            metrics.add(&metrics.tracks_created, created - created_seen);
            created_seen = created;
        }
        let tick = TrackedFrame {
            frame_id: frame.frame_id,
            timestamp: frame.timestamp,
            smoothed,
        };
        if out_tx.send(tick).await.is_err() {
            return;
        }
    }
    tracker.clear();
}

async fn run_decision(
    robot_id: String,
    config: Config,
    mut in_rx: mpsc::Receiver<TrackedFrame>,
    mut ctrl_rx: mpsc::Receiver<Label>,
    state_tx: mpsc::Sender<StateInput>,
) {
    let mut engine = DecisionEngine::new(config.decision.clone());
    loop {
        tokio::select! {
            tick = in_rx.recv() => {
                let Some(tick) = tick else { break };
                let events = engine.evaluate(&tick.smoothed, tick.frame_id, tick.timestamp);
                for event in events {
                    let input = StateInput::Decision {
                        robot_id: robot_id.clone(),
                        event,
                    };
                    if state_tx.send(input).await.is_err() {
                        return;
                    }
                }
            }
            closed = ctrl_rx.recv() => {
                match closed {
                    Some(label) => engine.notify_case_closed(label),
                    None => break,
                }
            }
        }
    }
}

/// The hub task: owns the state machine, consumes every input, routes
/// published events to their sinks.
pub async fn run_state_machine(
    mut machine: StateMachine,
    config: Config,
    mut rx: mpsc::Receiver<StateInput>,
    case_log_tx: mpsc::Sender<CaseRecord>,
    gui_tx: broadcast::Sender<String>,
    robot_cmd_tx: mpsc::Sender<(String, RobotCommand)>,
    feedback: FeedbackRegistry,
    metrics: PipelineMetrics,
) {
    let command_timeout = Duration::from_millis(config.session.command_timeout_ms);

    while let Some(input) = rx.recv().await {
        match input {
            StateInput::Decision { robot_id, event } => {
                machine.handle_decision(&robot_id, event);
            }
            StateInput::Telemetry {
                robot_id,
                status,
                location,
            } => {
                machine.handle_telemetry(&robot_id, status, location);
            }
            StateInput::Command(command) => {
                if let Err(e) = machine.handle_command(command, Utc::now()) {
                    warn!("operator command rejected: {e}");
                    let notice = serde_json::json!({ "event": "command_rejected", "reason": e.to_string() });
                    let _ = gui_tx.send(notice.to_string());
                }
            }
            StateInput::SessionLost { robot_id } => {
                machine.handle_session_lost(&robot_id, Utc::now());
                metrics.inc(&metrics.sessions_drained);
            }
            StateInput::DeliveryFailed { robot_id, command } => {
                machine.report_undelivered(&robot_id, command);
            }
        }

        // Drain until quiet: routing a command can publish a follow-up
        // (e.g. an undelivered notice) that must go out this tick too.
        loop {
            let events = machine.drain_events();
            if events.is_empty() {
                break;
            }
            for event in events {
                route_event(
                    event,
                    &case_log_tx,
                    &gui_tx,
                    &robot_cmd_tx,
                    &feedback,
                    &metrics,
                    command_timeout,
                    &mut machine,
                )
                .await;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn route_event(
    event: PipelineEvent,
    case_log_tx: &mpsc::Sender<CaseRecord>,
    gui_tx: &broadcast::Sender<String>,
    robot_cmd_tx: &mpsc::Sender<(String, RobotCommand)>,
    feedback: &FeedbackRegistry,
    metrics: &PipelineMetrics,
    command_timeout: Duration,
    machine: &mut StateMachine,
) {
    if let Ok(json) = serde_json::to_string(&event) {
        // No subscribers is fine; the GUI is an optional observer.
        let _ = gui_tx.send(json);
    }

    match event {
        PipelineEvent::CaseOpened { record } => {
            metrics.inc(&metrics.cases_opened);
            let _ = case_log_tx.send(record).await;
        }
        PipelineEvent::CaseFlagUpdated { record } => {
            let _ = case_log_tx.send(record).await;
        }
        PipelineEvent::CaseClosed {
            record,
            robot_id,
            label,
        } => {
            metrics.inc(&metrics.cases_closed);
            let _ = case_log_tx.send(record).await;
            let ctrl = feedback
                .lock()
                .expect("feedback registry poisoned")
                .get(&robot_id)
                .cloned();
            if let Some(ctrl) = ctrl {
                let _ = ctrl.try_send(label);
            }
        }
        PipelineEvent::RobotCommand { robot_id, command } => {
            let delivered =
                tokio::time::timeout(command_timeout, robot_cmd_tx.send((robot_id.clone(), command)))
                    .await;
            if !matches!(delivered, Ok(Ok(()))) {
                machine.report_undelivered(&robot_id, command);
            }
        }
        PipelineEvent::CommandUndelivered { .. } => {
            metrics.inc(&metrics.commands_undelivered);
        }
        PipelineEvent::SessionDrained { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OperatorAction;
    use crate::types::{Detection, SessionConfig};

    fn frame(frame_id: u64, detections: Vec<Detection>) -> DetectionResult {
        DetectionResult {
            frame_id,
            timestamp: Utc::now(),
            detections,
        }
    }

    fn gun(confidence: f32) -> Detection {
        Detection {
            label: Label::Gun,
            confidence,
            bbox: [100, 100, 200, 200],
        }
    }

    #[tokio::test]
    async fn sustained_detections_flow_through_to_a_decision_input() {
        let config = Config::default();
        let metrics = PipelineMetrics::new();
        let (state_tx, mut state_rx) = mpsc::channel(64);
        let feedback: FeedbackRegistry = Arc::new(Mutex::new(HashMap::new()));

        let pipeline =
            spawn_robot_pipeline("robot_1", &config, metrics.clone(), state_tx, &feedback);

        for fid in 1..=20u64 {
            pipeline.frame_tx.send(frame(fid, vec![gun(0.95)])).await.unwrap();
        }

        let input = tokio::time::timeout(Duration::from_secs(5), state_rx.recv())
            .await
            .expect("pipeline must emit a decision")
            .expect("channel open");
        match input {
            StateInput::Decision { robot_id, event } => {
                assert_eq!(robot_id, "robot_1");
                assert!(matches!(event, DecisionEvent::Triggered { label: Label::Gun, .. }));
            }
            other => panic!("unexpected input {other:?}"),
        }
        pipeline.shutdown();
    }

    #[tokio::test]
    async fn state_machine_task_routes_open_and_close_to_the_case_log() {
        let config = Config::default();
        let metrics = PipelineMetrics::new();
        let (state_tx, state_rx) = mpsc::channel(64);
        let (case_tx, mut case_rx) = mpsc::channel(64);
        let (gui_tx, _gui_keepalive) = broadcast::channel(64);
        let (robot_cmd_tx, _robot_cmd_rx) = mpsc::channel(64);
        let feedback: FeedbackRegistry = Arc::new(Mutex::new(HashMap::new()));

        let machine = StateMachine::new(SessionConfig::default());
        let hub = tokio::spawn(run_state_machine(
            machine,
            config,
            state_rx,
            case_tx,
            gui_tx,
            robot_cmd_tx,
            feedback,
            metrics.clone(),
        ));

        state_tx
            .send(StateInput::Decision {
                robot_id: "robot_1".to_string(),
                event: DecisionEvent::Triggered {
                    label: Label::Gun,
                    case_type: crate::types::CaseType::Danger,
                    frame_id: 5,
                    timestamp: Utc::now(),
                    confidence: 0.9,
                },
            })
            .await
            .unwrap();

        let opened = case_rx.recv().await.unwrap();
        assert_eq!(opened.is_case_closed, 0);

        state_tx
            .send(StateInput::Command(OperatorCommand::Case {
                case_id: opened.case_id,
                action: OperatorAction::CloseCase,
            }))
            .await
            .unwrap();

        let closed = case_rx.recv().await.unwrap();
        assert_eq!(closed.case_id, opened.case_id);
        assert_eq!(closed.is_case_closed, 1);
        assert!(closed.end_time.is_some());

        drop(state_tx);
        hub.await.unwrap();
    }
}
