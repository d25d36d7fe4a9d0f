use std::{cell::RefCell, rc::Rc};

use lab_bridge::EngineCalls;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineCall {
    AddScore {
        player_id: i32,
        score: f64,
    },
    AddBot {
        name: String,
        skill: f64,
        team: String,
    },
    Console {
        command: String,
    },
}

/// Engine stand-in that records every call a level makes.
#[derive(Clone, Default)]
pub struct RecordingEngine {
    calls: Rc<RefCell<Vec<EngineCall>>>,
    episode_time: Rc<RefCell<f64>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.borrow().clone()
    }

    pub fn set_episode_time(&self, seconds: f64) {
        *self.episode_time.borrow_mut() = seconds;
    }

    fn record(&self, call: EngineCall) {
        log::info!("engine call {call:?}");
        self.calls.borrow_mut().push(call);
    }
}

impl EngineCalls for RecordingEngine {
    fn add_score(&self, player_id: i32, score: f64) {
        self.record(EngineCall::AddScore { player_id, score });
    }

    fn add_bot(&self, name: &str, skill: f64, team: &str) {
        self.record(EngineCall::AddBot {
            name: name.to_string(),
            skill,
            team: team.to_string(),
        });
    }

    fn execute_console_command(&self, command: &str) {
        self.record(EngineCall::Console {
            command: command.to_string(),
        });
    }

    fn episode_time_seconds(&self) -> f64 {
        *self.episode_time.borrow()
    }
}
