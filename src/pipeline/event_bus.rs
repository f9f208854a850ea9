// src/pipeline/event_bus.rs
//
// Decoupled event system. The state machine publishes events instead of
// reaching into the case-log adapter, the GUI channel or the robot link.

use crate::codec::CaseRecord;
use crate::session::RobotCommand;
use crate::types::Label;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    CaseOpened {
        record: CaseRecord,
    },
    CaseFlagUpdated {
        record: CaseRecord,
    },
    CaseClosed {
        record: CaseRecord,
        robot_id: String,
        label: Label,
    },
    SessionDrained {
        robot_id: String,
        closed_cases: usize,
    },
    RobotCommand {
        robot_id: String,
        command: RobotCommand,
    },
    CommandUndelivered {
        robot_id: String,
        command: RobotCommand,
    },
}

pub struct EventBus {
    events: VecDeque<PipelineEvent>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_pending),
            max_pending,
        }
    }

    pub fn publish(&mut self, event: PipelineEvent) {
        if self.events.len() >= self.max_pending {
            warn!(
                "Event bus full ({} events), dropping oldest",
                self.max_pending
            );
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn drain(&mut self) -> Vec<PipelineEvent> {
        self.events.drain(..).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.len()
    }
}
