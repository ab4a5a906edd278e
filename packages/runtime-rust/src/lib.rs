//! meshrpc runtime: handler chains, engine lifecycle and a lightweight peer
//! registry for in-process microservice meshes.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod handler;
pub mod invocation;
pub mod network;
pub mod registry;
pub mod transport;
pub mod worker;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, EngineError, EngineState, LifecycleEvent, LifecycleListener};
pub use invocation::{Invocation, InvocationError, InvocationKind, ReferenceConfig, Response};
