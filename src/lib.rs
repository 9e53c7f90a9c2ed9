//! Assignment Repair - consistency engine for volunteer coordination
//!
//! Keeps assistance requests, their assignments and volunteer availability
//! free of corruption while live traffic keeps writing to the same store.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                       REPAIR SCHEDULER                         │
//! │                                                               │
//! │   ┌──────────┐   ┌───────────┐   ┌──────────┐   ┌─────────┐   │
//! │   │ Snapshot │──▶│  Checker  │──▶│ Policies │──▶│ Engine  │   │
//! │   └──────────┘   └───────────┘   └──────────┘   └─────────┘   │
//! │        ▲                                             │        │
//! └────────┼─────────────────────────────────────────────┼────────┘
//!          │                                             ▼
//!    ┌─────┴─────────────────────────────────────────────────┐
//!    │ Store adapter: requests / assignments / profiles      │
//!    └───────────────────────────────────────────────────────┘
//! ```
//!
//! - **Checker**: read-only scan producing typed [`Anomaly`] values
//! - **Repair engine**: one guarded single-row update per write, idempotent
//! - **Metrics**: auto-assignment success rate, never counting manual work
//! - **Scheduler**: periodic and on-demand passes with bounded concurrency

pub mod api;
pub mod audit;
pub mod checker;
pub mod cli;
pub mod config;
pub mod demo;
pub mod error;
pub mod metrics;
pub mod models;
pub mod repair;
pub mod report;
pub mod scheduler;
pub mod service;
pub mod store;

pub use audit::{AuditEntry, AuditLog};
pub use checker::{Anomaly, AnomalyKind, DesyncDirection, InvariantChecker};
pub use config::Config;
pub use error::{ConfigError, RepairError, StoreError};
pub use metrics::{MetricsEngine, MetricsWindow, SuccessRate};
pub use repair::{RepairEngine, RepairOutcome};
pub use report::{HealthReport, PassSummary};
pub use scheduler::RepairScheduler;
pub use service::RepairService;
pub use store::{MemoryStore, Snapshot, SqliteStore, StoreAdapter};
