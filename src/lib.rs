//! Simulator variable synchronization library.
//!
//! This library keeps cockpit instrument panels in step with a high-latency
//! host simulator: it polls subscribed variables on fixed cadences, caches the
//! last-known value per variable, shares one read across every panel that
//! displays it, and tells only the panels whose value changed to re-render.

pub mod cache;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod hook;
pub mod notifier;
pub mod registry;
pub mod scheduler;
pub mod source;
pub mod subscription;

pub use context::{EngineSnapshot, SyncContext, TickReport};
pub use driver::PollDriver;
pub use error::{Result, SyncError};
pub use hook::{HookScope, SimVarAccessor};
pub use notifier::RefreshPolicy;
pub use registry::{Key, Unit, canonicalize};
pub use source::{ExternalStateSource, MemorySource, ReadError, SimulatedPanelSource, Value};
