// src/main.rs

mod case_log;
mod codec;
mod config;
mod decision;
mod error;
mod intake;
mod pipeline;
mod session;
mod tracker;
mod types;

use anyhow::Result;
use case_log::{CaseLogAdapter, TcpCaseStore};
use codec::WireMessage;
use pipeline::metrics::PipelineMetrics;
use pipeline::{FeedbackRegistry, RobotPipeline, StateInput};
use session::{OperatorCommand, RobotCommand, StateMachine};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use types::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load_or_default("config.yaml")?;

    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| format!("patrol_pipeline={}", config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Patrol coordination server starting");
    info!("✓ Configuration loaded ({} robot slot(s))", config.server.robot_ids.len());

    let metrics = PipelineMetrics::new();
    let feedback: FeedbackRegistry = Arc::new(Mutex::new(HashMap::new()));
    let capacity = config.server.channel_capacity.max(1);

    let (state_tx, state_rx) = mpsc::channel::<StateInput>(capacity);
    let (case_tx, case_rx) = mpsc::channel(capacity);
    let (gui_tx, _gui_keepalive) = broadcast::channel::<String>(256);
    let (robot_cmd_tx, robot_cmd_rx) = mpsc::channel::<(String, RobotCommand)>(capacity);

    let adapter = CaseLogAdapter::new(
        TcpCaseStore::new(config.persistence.store_addr.clone()),
        config.persistence.clone(),
        case_rx,
        metrics.clone(),
    );
    tokio::spawn(adapter.run());
    info!("✓ Case-log adapter ready");

    tokio::spawn(pipeline::run_state_machine(
        StateMachine::new(config.session.clone()),
        config.clone(),
        state_rx,
        case_tx,
        gui_tx.clone(),
        robot_cmd_tx,
        feedback.clone(),
        metrics.clone(),
    ));
    info!("✓ State machine ready");

    tokio::spawn(run_robot_link(
        config.server.robot_controller_addr.clone(),
        Duration::from_millis(config.session.command_timeout_ms),
        robot_cmd_rx,
        state_tx.clone(),
    ));

    let detector_slots = IdPool::new(&config.server.robot_ids);
    tokio::spawn(serve_detector(
        config.clone(),
        detector_slots,
        state_tx.clone(),
        feedback.clone(),
        metrics.clone(),
    ));

    let robot_slots = IdPool::new(&config.server.robot_ids);
    tokio::spawn(serve_robots(
        config.server.robot_bind.clone(),
        robot_slots,
        state_tx.clone(),
        metrics.clone(),
    ));

    tokio::spawn(serve_commands(
        config.server.command_bind.clone(),
        state_tx.clone(),
        metrics.clone(),
    ));

    tokio::spawn(serve_gui(config.server.gui_bind.clone(), gui_tx.clone()));

    tokio::spawn(report_metrics(metrics.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    info!("final metrics: {}", serde_json::to_string(&metrics.summary())?);
    Ok(())
}

/// Robot ids handed to connections in accept order, returned on disconnect.
#[derive(Clone)]
struct IdPool {
    slots: Arc<Mutex<Vec<(String, bool)>>>,
}

impl IdPool {
    fn new(ids: &[String]) -> Self {
        Self {
            slots: Arc::new(Mutex::new(
                ids.iter().map(|id| (id.clone(), false)).collect(),
            )),
        }
    }

    fn acquire(&self) -> Option<String> {
        let mut slots = self.slots.lock().expect("id pool poisoned");
        for (id, taken) in slots.iter_mut() {
            if !*taken {
                *taken = true;
                return Some(id.clone());
            }
        }
        None
    }

    fn release(&self, id: &str) {
        let mut slots = self.slots.lock().expect("id pool poisoned");
        if let Some((_, taken)) = slots.iter_mut().find(|(slot, _)| slot == id) {
            *taken = false;
        }
    }
}

/// Detector frame listener. One connection per robot's analyzed-frame
/// stream; each connection gets its own stage chain.
async fn serve_detector(
    config: Config,
    slots: IdPool,
    state_tx: mpsc::Sender<StateInput>,
    feedback: FeedbackRegistry,
    metrics: PipelineMetrics,
) {
    let listener = match TcpListener::bind(&config.server.detector_bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind detector listener on {}: {e}", config.server.detector_bind);
            return;
        }
    };
    info!("✓ Detector listener on {}", config.server.detector_bind);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("detector accept failed: {e}");
                continue;
            }
        };
        let Some(robot_id) = slots.acquire() else {
            warn!(%peer, "no free robot slot, refusing detector connection");
            continue;
        };
        info!(%peer, robot_id, "detector stream connected");

        let chain = pipeline::spawn_robot_pipeline(
            &robot_id,
            &config,
            metrics.clone(),
            state_tx.clone(),
            &feedback,
        );
        tokio::spawn(detector_connection(
            stream,
            robot_id,
            chain,
            slots.clone(),
            state_tx.clone(),
            feedback.clone(),
            metrics.clone(),
        ));
    }
}

async fn detector_connection(
    mut stream: TcpStream,
    robot_id: String,
    chain: RobotPipeline,
    slots: IdPool,
    state_tx: mpsc::Sender<StateInput>,
    feedback: FeedbackRegistry,
    metrics: PipelineMetrics,
) {
    loop {
        match codec::read_message(&mut stream).await {
            Ok(Some(WireMessage::DetectionResult(result))) => {
                if chain.frame_tx.send(result).await.is_err() {
                    break;
                }
            }
            Ok(Some(other)) => {
                metrics.inc(&metrics.malformed_messages);
                warn!(robot_id, "unexpected message on detector stream: {other:?}");
            }
            Ok(None) => break,
            Err(e) => {
                // Framing stayed intact, only the payload was bad; skip it.
                if e.downcast_ref::<error::PipelineError>().is_some() {
                    metrics.inc(&metrics.malformed_messages);
                    warn!(robot_id, "malformed detector message: {e:#}");
                    continue;
                }
                warn!(robot_id, "detector stream error: {e:#}");
                break;
            }
        }
    }

    warn!(
        "{}, draining open cases",
        error::PipelineError::SessionLost {
            robot_id: robot_id.clone()
        }
    );
    let _ = state_tx
        .send(StateInput::SessionLost {
            robot_id: robot_id.clone(),
        })
        .await;
    feedback
        .lock()
        .expect("feedback registry poisoned")
        .remove(&robot_id);
    chain.shutdown();
    slots.release(&robot_id);
}

/// Robot packet listener. Telemetry rides on every detection packet; the
/// raw detections themselves are analyzed upstream, so only status and
/// location matter here.
async fn serve_robots(
    bind: String,
    slots: IdPool,
    state_tx: mpsc::Sender<StateInput>,
    metrics: PipelineMetrics,
) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind robot listener on {bind}: {e}");
            return;
        }
    };
    info!("✓ Robot listener on {bind}");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("robot accept failed: {e}");
                continue;
            }
        };
        let Some(robot_id) = slots.acquire() else {
            warn!(%peer, "no free robot slot, refusing robot connection");
            continue;
        };
        info!(%peer, robot_id, "robot connected");
        tokio::spawn(robot_connection(
            stream,
            robot_id,
            slots.clone(),
            state_tx.clone(),
            metrics.clone(),
        ));
    }
}

async fn robot_connection(
    mut stream: TcpStream,
    robot_id: String,
    slots: IdPool,
    state_tx: mpsc::Sender<StateInput>,
    metrics: PipelineMetrics,
) {
    loop {
        match codec::read_message(&mut stream).await {
            Ok(Some(WireMessage::DetectionPacket(packet))) => {
                let input = StateInput::Telemetry {
                    robot_id: robot_id.clone(),
                    status: packet.robot_status,
                    location: packet.location,
                };
                if state_tx.send(input).await.is_err() {
                    break;
                }
            }
            Ok(Some(other)) => {
                metrics.inc(&metrics.malformed_messages);
                warn!(robot_id, "unexpected message on robot stream: {other:?}");
            }
            Ok(None) => break,
            Err(e) => {
                if e.downcast_ref::<error::PipelineError>().is_some() {
                    metrics.inc(&metrics.malformed_messages);
                    warn!(robot_id, "malformed robot packet: {e:#}");
                    continue;
                }
                warn!(robot_id, "robot stream error: {e:#}");
                break;
            }
        }
    }

    warn!(
        "{}, draining open cases",
        error::PipelineError::SessionLost {
            robot_id: robot_id.clone()
        }
    );
    let _ = state_tx
        .send(StateInput::SessionLost {
            robot_id: robot_id.clone(),
        })
        .await;
    slots.release(&robot_id);
}

/// Operator command listener (GUI side).
async fn serve_commands(
    bind: String,
    state_tx: mpsc::Sender<StateInput>,
    metrics: PipelineMetrics,
) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind command listener on {bind}: {e}");
            return;
        }
    };
    info!("✓ Command listener on {bind}");

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("command accept failed: {e}");
                continue;
            }
        };
        let state_tx = state_tx.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            debug!(%peer, "operator connected");
            loop {
                match codec::read_json::<_, OperatorCommand>(&mut stream).await {
                    Ok(Some(command)) => {
                        if state_tx.send(StateInput::Command(command)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if e.downcast_ref::<error::PipelineError>().is_some() {
                            metrics.inc(&metrics.malformed_messages);
                            warn!("malformed operator command: {e:#}");
                            continue;
                        }
                        warn!("operator stream error: {e:#}");
                        break;
                    }
                }
            }
            debug!(%peer, "operator disconnected");
        });
    }
}

/// GUI event fan-out. Subscribers get every published event as a framed
/// JSON payload; a slow subscriber that lags is skipped past, not waited on.
async fn serve_gui(bind: String, gui_tx: broadcast::Sender<String>) {
    let listener = match TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot bind GUI listener on {bind}: {e}");
            return;
        }
    };
    info!("✓ GUI listener on {bind}");

    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("GUI accept failed: {e}");
                continue;
            }
        };
        let mut events = gui_tx.subscribe();
        tokio::spawn(async move {
            info!(%peer, "GUI subscriber connected");
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if codec::write_frame(&mut stream, event.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%peer, missed, "GUI subscriber lagging, events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            info!(%peer, "GUI subscriber disconnected");
        });
    }
}

/// Deliver movement commands to the robot controller. One connection per
/// command keeps a dead controller from wedging the queue; a failed or
/// timed-out delivery is reported back instead of retried blindly.
async fn run_robot_link(
    controller_addr: String,
    timeout: Duration,
    mut rx: mpsc::Receiver<(String, RobotCommand)>,
    state_tx: mpsc::Sender<StateInput>,
) {
    while let Some((robot_id, command)) = rx.recv().await {
        let delivery = tokio::time::timeout(
            timeout,
            deliver_command(&controller_addr, &robot_id, command),
        )
        .await;
        match delivery {
            Ok(Ok(())) => {
                debug!(robot_id, command = command.as_str(), "command delivered");
            }
            Ok(Err(e)) => {
                warn!(robot_id, command = command.as_str(), "delivery failed: {e:#}");
                let _ = state_tx
                    .send(StateInput::DeliveryFailed { robot_id, command })
                    .await;
            }
            Err(_) => {
                warn!(
                    robot_id,
                    command = command.as_str(),
                    timeout_ms = timeout.as_millis() as u64,
                    "delivery timed out"
                );
                let _ = state_tx
                    .send(StateInput::DeliveryFailed { robot_id, command })
                    .await;
            }
        }
    }
}

async fn deliver_command(addr: &str, robot_id: &str, command: RobotCommand) -> Result<()> {
    let mut stream = TcpStream::connect(addr).await?;
    let payload = serde_json::json!({
        "robot_id": robot_id,
        "cmd": command.as_str(),
    });
    codec::write_json(&mut stream, &payload).await?;
    Ok(())
}

async fn report_metrics(metrics: PipelineMetrics) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    interval.tick().await;
    loop {
        interval.tick().await;
        let summary = metrics.summary();
        info!(
            fps = format!("{:.1}", summary.fps),
            frames = summary.frames_dispatched,
            stale = summary.stale_frames,
            open = summary.cases_opened - summary.cases_closed.min(summary.cases_opened),
            persisted_failures = summary.persistence_failures,
            "pipeline metrics"
        );
    }
}
