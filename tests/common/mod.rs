#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::Once;

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TestPlayer {
    pub id: i64,
    pub name: String,
    pub score: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct TestGame {
    pub phase: String,
    pub round: u32,
    pub players: Vec<TestPlayer>,
}

pub fn create_test_game() -> TestGame {
    TestGame {
        phase: "lobby".to_string(),
        round: 0,
        players: vec![
            TestPlayer {
                id: 1,
                name: "Test Player".to_string(),
                score: 0,
            },
            TestPlayer {
                id: 2,
                name: "Other Player".to_string(),
                score: 0,
            },
        ],
    }
}

/// Installs a log subscriber once per test binary; `RUST_LOG` controls output.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
