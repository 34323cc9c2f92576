//! Process and job orchestration core.
//!
//! - [`ports`] hands out free TCP ports for dev servers.
//! - [`hub`] owns the observer registry and channel fan-out.
//! - [`process`] spawns and supervises OS child processes.
//! - [`queue`] admits build/deploy jobs under a concurrency cap.
//! - [`lifecycle`] owns per-project status and dev servers.
//! - [`store`] is the write-behind project registry.
//! - [`plane`] wires them together.
//!
//! Each component owns its state behind its own lock and never reaches into
//! another's; they talk through method calls and hub messages only.

pub mod commands;
pub mod events;
pub mod hub;
pub mod lifecycle;
pub mod models;
pub mod plane;
pub mod ports;
pub mod process;
pub mod progress;
pub mod queue;
pub mod store;

pub use hub::EventHub;
pub use lifecycle::ProcessManager;
pub use plane::ControlPlane;
pub use queue::BuildQueue;
