//! Test doubles for the external collaborators

pub mod mocks;

pub use mocks::{
    LogNotifier, MemoryNetwork, MemoryTransport, MockRenderState, NoopUploader, RecordingNotifier,
    ScriptedTransport, SentMessage, StaticHashOracle,
};
