//! Self-healing worker membership for RK8s.
//!
//! Workers register themselves as ephemeral entries under a namespace node of
//! the coordination store. The [`controller::Controller`] watches that
//! namespace and starts a new worker whenever fewer entries than desired are
//! registered.

pub mod config;
pub mod controller;
pub mod coordination;
pub mod launcher;
pub mod namespace;
pub mod reconciler;
pub mod session;
pub mod xline;

pub use config::{Config, XlineConfig, load_config};
pub use controller::{Controller, ControllerOptions};
pub use coordination::{
    Connector, CoordinationError, Coordinator, CreateMode, NodeStat, SessionEvent,
};
pub use launcher::{LaunchCommand, LaunchError, OsProcessHost, ProcessHost, WorkerLauncher};
pub use namespace::{NamespaceStatus, ensure_namespace};
pub use reconciler::{ReconcileOutcome, Reconciler};
