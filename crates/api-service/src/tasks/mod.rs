//! Background tasks for the API service.

pub mod heartbeat;

pub use heartbeat::{
    heartbeat_once, ExitProcess, HeartbeatError, HeartbeatWatchdog, ProcessTerminator,
    RecordingTerminator, WatchdogOutcome,
};
