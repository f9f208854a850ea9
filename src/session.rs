// src/session.rs
//
// Robot/session state machine. Owns every RobotSession and every Case;
// no other component mutates them. Consumes decision events, telemetry
// and operator commands; publishes case mutations and robot commands on
// the event bus.
//
// Status precedence: `detected` is entered when any case opens for a robot
// and cannot be overridden by telemetry while a case is open. Telemetry
// received in that state retargets the status the robot resumes once its
// last open case closes.

use crate::codec::CaseRecord;
use crate::decision::DecisionEvent;
use crate::error::PipelineError;
use crate::pipeline::event_bus::{EventBus, PipelineEvent};
use crate::types::{CaseType, Label, Location, RobotStatus, SessionConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// Operator resolutions applied to an open case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorAction {
    Ignore,
    #[serde(rename = "report_119")]
    Report119,
    #[serde(rename = "report_112")]
    Report112,
    WarnIllegal,
    WarnDanger,
    WarnEmergency,
    CloseCase,
}

/// Movement commands forwarded to the robot controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotCommand {
    MoveToA,
    MoveToB,
    ReturnToBase,
}

impl RobotCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MoveToA => "move_to_a",
            Self::MoveToB => "move_to_b",
            Self::ReturnToBase => "return_to_base",
        }
    }
}

/// Wire shape of an operator command from the GUI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OperatorCommand {
    Case { case_id: u64, action: OperatorAction },
    Move { robot_id: String, command: RobotCommand },
}

/// An incident record across its open-to-closed lifecycle.
#[derive(Debug, Clone)]
pub struct Case {
    pub case_id: u64,
    pub case_type: CaseType,
    pub detection_type: Label,
    pub robot_id: String,
    pub location: Location,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_ignored: bool,
    pub is_119_reported: bool,
    pub is_112_reported: bool,
    pub is_illegal_warned: bool,
    pub is_danger_warned: bool,
    pub is_emergency_warned: bool,
    pub closed: bool,
}

impl Case {
    pub fn to_record(&self, user_id: &str) -> CaseRecord {
        CaseRecord {
            case_id: self.case_id,
            case_type: self.case_type,
            detection_type: self.detection_type,
            robot_id: self.robot_id.clone(),
            user_id: user_id.to_string(),
            location: self.location,
            is_ignored: self.is_ignored as u8,
            is_119_reported: self.is_119_reported as u8,
            is_112_reported: self.is_112_reported as u8,
            is_illegal_warned: self.is_illegal_warned as u8,
            is_danger_warned: self.is_danger_warned as u8,
            is_emergency_warned: self.is_emergency_warned as u8,
            is_case_closed: self.closed as u8,
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RobotSession {
    pub robot_id: String,
    pub status: RobotStatus,
    pub location: Location,
    /// Status to restore once the last open case closes.
    pub resume_status: RobotStatus,
}

impl RobotSession {
    fn new(robot_id: &str) -> Self {
        Self {
            robot_id: robot_id.to_string(),
            status: RobotStatus::Idle,
            location: Location::Base,
            resume_status: RobotStatus::Idle,
        }
    }
}

pub struct StateMachine {
    config: SessionConfig,
    sessions: HashMap<String, RobotSession>,
    cases: HashMap<u64, Case>,
    open_by_key: HashMap<(String, Label), u64>,
    next_case_id: u64,
    bus: EventBus,
}

impl StateMachine {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            cases: HashMap::new(),
            open_by_key: HashMap::new(),
            next_case_id: 1,
            bus: EventBus::new(256),
        }
    }

    pub fn drain_events(&mut self) -> Vec<PipelineEvent> {
        self.bus.drain()
    }

    pub fn session(&self, robot_id: &str) -> Option<&RobotSession> {
        self.sessions.get(robot_id)
    }

    pub fn case(&self, case_id: u64) -> Option<&Case> {
        self.cases.get(&case_id)
    }

    pub fn open_cases_for(&self, robot_id: &str) -> usize {
        self.open_by_key.keys().filter(|(r, _)| r == robot_id).count()
    }

    /// Telemetry from the robot's detection packets. Incident state takes
    /// precedence: while any case is open the reported locomotion status
    /// only retargets what the robot resumes after closure.
    pub fn handle_telemetry(&mut self, robot_id: &str, status: RobotStatus, location: Location) {
        let has_open = self.open_cases_for(robot_id) > 0;
        let session = self
            .sessions
            .entry(robot_id.to_string())
            .or_insert_with(|| RobotSession::new(robot_id));
        session.location = location;

        if has_open {
            if status != RobotStatus::Detected {
                session.resume_status = status;
            }
        } else {
            session.status = status;
            session.resume_status = status;
        }
    }

    /// Apply a decision engine event for one robot.
    pub fn handle_decision(&mut self, robot_id: &str, event: DecisionEvent) {
        match event {
            DecisionEvent::Triggered {
                label,
                case_type,
                timestamp,
                ..
            } => self.open_case(robot_id, label, case_type, timestamp),
            DecisionEvent::EvidenceCleared { label, timestamp } => {
                let key = (robot_id.to_string(), label);
                if let Some(&case_id) = self.open_by_key.get(&key) {
                    info!(case_id, label = label.as_str(), "cool-down elapsed, auto-closing case");
                    self.close_case(case_id, timestamp);
                }
            }
        }
    }

    fn open_case(&mut self, robot_id: &str, label: Label, case_type: CaseType, timestamp: DateTime<Utc>) {
        let key = (robot_id.to_string(), label);
        if self.open_by_key.contains_key(&key) {
            warn!(
                robot_id,
                label = label.as_str(),
                "trigger for a label that already has an open case, ignoring"
            );
            return;
        }

        let session = self
            .sessions
            .entry(robot_id.to_string())
            .or_insert_with(|| RobotSession::new(robot_id));
        if session.status != RobotStatus::Detected {
            session.resume_status = session.status;
            session.status = RobotStatus::Detected;
        }

        let case_id = self.next_case_id;
        self.next_case_id += 1;
        let case = Case {
            case_id,
            case_type,
            detection_type: label,
            robot_id: robot_id.to_string(),
            location: session.location,
            start_time: timestamp,
            end_time: None,
            is_ignored: false,
            is_119_reported: false,
            is_112_reported: false,
            is_illegal_warned: false,
            is_danger_warned: false,
            is_emergency_warned: false,
            closed: false,
        };
        info!(
            case_id,
            robot_id,
            label = label.as_str(),
            case_type = case_type.as_str(),
            "case opened"
        );
        let record = case.to_record(&self.config.user_id);
        self.cases.insert(case_id, case);
        self.open_by_key.insert(key, case_id);
        self.bus.publish(PipelineEvent::CaseOpened { record });
    }

    /// Apply an operator command. Commands on a missing or closed case are
    /// rejected with `StaleCommand` and have no effect.
    pub fn handle_command(
        &mut self,
        command: OperatorCommand,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        match command {
            OperatorCommand::Case { case_id, action } => self.apply_case_action(case_id, action, now),
            OperatorCommand::Move { robot_id, command } => {
                self.handle_move(&robot_id, command);
                Ok(())
            }
        }
    }

    fn apply_case_action(
        &mut self,
        case_id: u64,
        action: OperatorAction,
        now: DateTime<Utc>,
    ) -> Result<(), PipelineError> {
        let case = self.cases.get_mut(&case_id);
        let Some(case) = case.filter(|c| !c.closed) else {
            warn!(case_id, ?action, "command addressed to missing or closed case");
            return Err(PipelineError::StaleCommand { case_id });
        };

        match action {
            OperatorAction::Ignore => case.is_ignored = true,
            OperatorAction::Report119 => case.is_119_reported = true,
            OperatorAction::Report112 => case.is_112_reported = true,
            OperatorAction::WarnIllegal => case.is_illegal_warned = true,
            OperatorAction::WarnDanger => case.is_danger_warned = true,
            OperatorAction::WarnEmergency => case.is_emergency_warned = true,
            OperatorAction::CloseCase => {
                self.close_case(case_id, now);
                return Ok(());
            }
        }
        info!(case_id, ?action, "case flag updated");
        let record = self.cases[&case_id].to_record(&self.config.user_id);
        self.bus.publish(PipelineEvent::CaseFlagUpdated { record });
        Ok(())
    }

    fn handle_move(&mut self, robot_id: &str, command: RobotCommand) {
        let has_open = self.open_cases_for(robot_id) > 0;
        let session = self
            .sessions
            .entry(robot_id.to_string())
            .or_insert_with(|| RobotSession::new(robot_id));
        if has_open {
            // Incident state wins; the robot moves but stays `detected`
            // until the operator resolves the open cases.
            session.resume_status = RobotStatus::Moving;
        } else {
            session.status = RobotStatus::Moving;
            session.resume_status = RobotStatus::Moving;
        }
        info!(robot_id, command = command.as_str(), "robot command issued");
        self.bus.publish(PipelineEvent::RobotCommand {
            robot_id: robot_id.to_string(),
            command,
        });
    }

    fn close_case(&mut self, case_id: u64, end_time: DateTime<Utc>) {
        let Some(case) = self.cases.get_mut(&case_id) else {
            return;
        };
        case.closed = true;
        case.end_time = Some(end_time);
        let robot_id = case.robot_id.clone();
        let label = case.detection_type;
        let record = case.to_record(&self.config.user_id);
        self.open_by_key.remove(&(robot_id.clone(), label));

        if self.open_cases_for(&robot_id) == 0 {
            if let Some(session) = self.sessions.get_mut(&robot_id) {
                session.status = session.resume_status;
                info!(
                    robot_id,
                    status = session.status.as_str(),
                    "last open case closed, restoring pre-incident status"
                );
            }
        }
        info!(case_id, robot_id, label = label.as_str(), "case closed");
        self.bus.publish(PipelineEvent::CaseClosed {
            record,
            robot_id,
            label,
        });
    }

    /// Forced drain on session loss: every open case for the robot is
    /// closed so nothing is left permanently open with no path to closure,
    /// and the closure is surfaced to the operator.
    pub fn handle_session_lost(&mut self, robot_id: &str, now: DateTime<Utc>) {
        let open: Vec<u64> = self
            .open_by_key
            .iter()
            .filter(|((r, _), _)| r == robot_id)
            .map(|(_, &id)| id)
            .collect();
        let closed_cases = open.len();
        for case_id in open {
            warn!(case_id, robot_id, "session lost, force-closing case");
            self.close_case(case_id, now);
        }
        self.sessions.remove(robot_id);
        self.bus.publish(PipelineEvent::SessionDrained {
            robot_id: robot_id.to_string(),
            closed_cases,
        });
    }

    /// Delivery failure reported by the robot link.
    pub fn report_undelivered(&mut self, robot_id: &str, command: RobotCommand) {
        warn!(robot_id, command = command.as_str(), "robot command undelivered");
        self.bus.publish(PipelineEvent::CommandUndelivered {
            robot_id: robot_id.to_string(),
            command,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn machine() -> StateMachine {
        StateMachine::new(SessionConfig::default())
    }

    fn trigger(label: Label, case_type: CaseType) -> DecisionEvent {
        DecisionEvent::Triggered {
            label,
            case_type,
            frame_id: 10,
            timestamp: t0(),
            confidence: 0.9,
        }
    }

    fn opened_case_id(events: &[PipelineEvent]) -> u64 {
        events
            .iter()
            .find_map(|e| match e {
                PipelineEvent::CaseOpened { record } => Some(record.case_id),
                _ => None,
            })
            .expect("a case must have opened")
    }

    #[test]
    fn trigger_opens_case_and_enters_detected() {
        let mut sm = machine();
        sm.handle_telemetry("robot_1", RobotStatus::Patrolling, Location::A);
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));

        let events = sm.drain_events();
        let case_id = opened_case_id(&events);
        let case = sm.case(case_id).unwrap();
        assert_eq!(case.detection_type, Label::Gun);
        assert_eq!(case.case_type, CaseType::Danger);
        assert_eq!(case.location, Location::A);
        assert_eq!(case.start_time, t0());
        assert!(!case.closed);
        assert_eq!(sm.session("robot_1").unwrap().status, RobotStatus::Detected);
    }

    #[test]
    fn telemetry_cannot_override_detected_while_a_case_is_open() {
        let mut sm = machine();
        sm.handle_telemetry("robot_1", RobotStatus::Patrolling, Location::A);
        sm.handle_decision("robot_1", trigger(Label::Knife, CaseType::Danger));
        let case_id = opened_case_id(&sm.drain_events());

        sm.handle_telemetry("robot_1", RobotStatus::Moving, Location::B);
        assert_eq!(sm.session("robot_1").unwrap().status, RobotStatus::Detected);

        // Closing releases the precedence; the latest telemetry wins.
        sm.handle_command(
            OperatorCommand::Case {
                case_id,
                action: OperatorAction::CloseCase,
            },
            t0() + chrono::Duration::seconds(30),
        )
        .unwrap();
        assert_eq!(sm.session("robot_1").unwrap().status, RobotStatus::Moving);
        assert_eq!(sm.session("robot_1").unwrap().location, Location::B);
    }

    #[test]
    fn close_sets_end_time_and_repeat_close_is_stale() {
        let mut sm = machine();
        sm.handle_telemetry("robot_1", RobotStatus::Patrolling, Location::A);
        sm.handle_decision("robot_1", trigger(Label::Cigarette, CaseType::Illegal));
        let case_id = opened_case_id(&sm.drain_events());

        let end = t0() + chrono::Duration::seconds(60);
        sm.handle_command(
            OperatorCommand::Case {
                case_id,
                action: OperatorAction::CloseCase,
            },
            end,
        )
        .unwrap();
        let case = sm.case(case_id).unwrap();
        assert!(case.closed);
        assert_eq!(case.end_time, Some(end));

        let err = sm
            .handle_command(
                OperatorCommand::Case {
                    case_id,
                    action: OperatorAction::CloseCase,
                },
                end + chrono::Duration::seconds(1),
            )
            .unwrap_err();
        assert_eq!(err, PipelineError::StaleCommand { case_id });
        // No further effect: end_time is unchanged.
        assert_eq!(sm.case(case_id).unwrap().end_time, Some(end));
    }

    #[test]
    fn command_on_unknown_case_is_stale() {
        let mut sm = machine();
        let err = sm
            .handle_command(
                OperatorCommand::Case {
                    case_id: 99,
                    action: OperatorAction::Ignore,
                },
                t0(),
            )
            .unwrap_err();
        assert_eq!(err, PipelineError::StaleCommand { case_id: 99 });
    }

    #[test]
    fn flag_actions_update_the_record_and_publish() {
        let mut sm = machine();
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));
        let case_id = opened_case_id(&sm.drain_events());

        sm.handle_command(
            OperatorCommand::Case {
                case_id,
                action: OperatorAction::Report112,
            },
            t0(),
        )
        .unwrap();
        sm.handle_command(
            OperatorCommand::Case {
                case_id,
                action: OperatorAction::WarnDanger,
            },
            t0(),
        )
        .unwrap();

        let events = sm.drain_events();
        assert_eq!(events.len(), 2);
        match events.last().unwrap() {
            PipelineEvent::CaseFlagUpdated { record } => {
                assert_eq!(record.is_112_reported, 1);
                assert_eq!(record.is_danger_warned, 1);
                assert_eq!(record.is_case_closed, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn detected_persists_until_the_last_open_case_closes() {
        let mut sm = machine();
        sm.handle_telemetry("robot_1", RobotStatus::Patrolling, Location::B);
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));
        sm.handle_decision("robot_1", trigger(Label::LyingDown, CaseType::Emergency));
        let events = sm.drain_events();
        let ids: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::CaseOpened { record } => Some(record.case_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1], "case ids are monotonic");

        sm.handle_command(
            OperatorCommand::Case {
                case_id: ids[0],
                action: OperatorAction::CloseCase,
            },
            t0(),
        )
        .unwrap();
        assert_eq!(sm.session("robot_1").unwrap().status, RobotStatus::Detected);

        sm.handle_command(
            OperatorCommand::Case {
                case_id: ids[1],
                action: OperatorAction::CloseCase,
            },
            t0(),
        )
        .unwrap();
        assert_eq!(sm.session("robot_1").unwrap().status, RobotStatus::Patrolling);
    }

    #[test]
    fn second_trigger_for_same_label_does_not_open_a_duplicate() {
        let mut sm = machine();
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));
        let opened = sm
            .drain_events()
            .iter()
            .filter(|e| matches!(e, PipelineEvent::CaseOpened { .. }))
            .count();
        assert_eq!(opened, 1);
        assert_eq!(sm.open_cases_for("robot_1"), 1);
    }

    #[test]
    fn evidence_cleared_auto_closes_the_open_case() {
        let mut sm = machine();
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));
        let case_id = opened_case_id(&sm.drain_events());

        let end = t0() + chrono::Duration::seconds(10);
        sm.handle_decision(
            "robot_1",
            DecisionEvent::EvidenceCleared {
                label: Label::Gun,
                timestamp: end,
            },
        );
        let case = sm.case(case_id).unwrap();
        assert!(case.closed);
        assert_eq!(case.end_time, Some(end));
    }

    #[test]
    fn session_lost_force_closes_everything_for_that_robot_only() {
        let mut sm = machine();
        sm.handle_decision("robot_1", trigger(Label::Gun, CaseType::Danger));
        sm.handle_decision("robot_2", trigger(Label::Cigarette, CaseType::Illegal));
        sm.drain_events();

        sm.handle_session_lost("robot_1", t0() + chrono::Duration::seconds(5));
        let events = sm.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            PipelineEvent::SessionDrained { robot_id, closed_cases: 1 } if robot_id == "robot_1"
        )));
        assert_eq!(sm.open_cases_for("robot_1"), 0);
        assert!(sm.session("robot_1").is_none());
        // The other robot's pipeline keeps serving.
        assert_eq!(sm.open_cases_for("robot_2"), 1);
    }

    #[test]
    fn move_command_publishes_to_the_robot_channel() {
        let mut sm = machine();
        sm.handle_command(
            OperatorCommand::Move {
                robot_id: "robot_1".to_string(),
                command: RobotCommand::MoveToA,
            },
            t0(),
        )
        .unwrap();
        let events = sm.drain_events();
        assert!(matches!(
            events.as_slice(),
            [PipelineEvent::RobotCommand { command: RobotCommand::MoveToA, .. }]
        ));
        assert_eq!(sm.session("robot_1").unwrap().status, RobotStatus::Moving);
    }
}
