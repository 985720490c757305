//! Bookkeeping for a session: how many commands ran, how long they took, how many frames went out.

use serde::Serialize;
use std::time::{Duration, Instant};

pub struct ServerState {
    started: Instant,
    commands: u64,
    failed: u64,
    command_time: Duration,
    batches: u64,
    frames: u64,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            commands: 0,
            failed: 0,
            command_time: Duration::default(),
            batches: 0,
            frames: 0,
        }
    }

    pub fn record_command(&mut self, elapsed: Duration, failed: bool) {
        self.commands += 1;
        self.command_time += elapsed;
        if failed {
            self.failed += 1;
        }
    }

    pub fn record_batch(&mut self) {
        self.batches += 1;
    }

    pub fn record_frame(&mut self) {
        self.frames += 1;
    }

    pub fn command_count(&self) -> u64 {
        self.commands
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn report(&self, bytes_received: u64) -> SessionStats {
        SessionStats {
            commands: self.commands,
            failed_commands: self.failed,
            command_seconds: self.command_time.as_secs_f64(),
            batches: self.batches,
            frames: self.frames,
            bytes_received,
            elapsed_seconds: self.elapsed().as_secs_f64(),
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// The summary that is logged when a session ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub commands: u64,
    pub failed_commands: u64,
    pub command_seconds: f64,
    pub batches: u64,
    pub frames: u64,
    pub bytes_received: u64,
    pub elapsed_seconds: f64,
}
