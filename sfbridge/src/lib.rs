//! sfbridge: run a soundfont rendering engine off the caller's thread.
//!
//! A [`RenderClient`] owns one worker, either a dedicated thread or a child
//! process, and exposes the engine as typed async calls. Requests are
//! correlated by id, binary payloads move across without copying where the
//! backend allows, and every failure inside the worker comes back as an error
//! on the one call that caused it.

pub mod bridge;
pub mod client;
pub mod config;
pub mod engine;
pub mod logging;
mod version;
pub mod worker;

#[cfg(test)]
mod testing;

pub use bridge::protocol::CallId;
pub use bridge::transport::{
    Backend, ChannelError, ChannelEvent, ProcessImage, SpawnError, WorkerChannel, WorkerImage,
    create_channel,
};
pub use client::{ClientError, RenderClient};
pub use config::{BackendPreference, BridgeConfig};
pub use engine::{
    Engine, EngineError, EngineFactory, FileInfo, MmlError, MmlOutput, Preset, SoundfontInfo,
};
pub use version::{SFBRIDGE_VERSION, VersionInfo};
pub use worker::{
    EnginePhase, EngineState, HandleError, StreamPort, WorkerHost, WorkerPort,
    is_worker_process, run_stdio_worker, run_worker,
};
