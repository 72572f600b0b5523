//! Server node entrypoint: wires the store, broker, event bus, session
//! manager, command dispatcher, config pusher, node pool registry and
//! tunnel manager into one running node, then fronts them with whichever
//! transport adapters this node listens on (spec §4.1-§4.11).
//!
//! Mirrors the teacher's `AgentServer` split: a config struct, a server
//! struct built from it via `new`, and a `run(self)` that drives everything
//! until its scope closes.

pub mod server;

pub use server::{Server, ServerConfig};
