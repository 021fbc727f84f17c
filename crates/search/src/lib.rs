//! Query side of otq: statement renderers, the store client, per-kind
//! request lifecycle and the [`Engine`] tying them together.

pub mod autorange;
pub mod classify;
pub mod client;
pub mod dsl;
pub mod engine;
pub mod esql;
pub mod lifecycle;

pub use engine::{Engine, EngineConfig, Perspective};
pub use lifecycle::{Completion, RequestContext, RequestKind, RequestManager};
