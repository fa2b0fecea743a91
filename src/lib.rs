//! driftguard - drift detection and reconciliation
//!
//! Compares declared, last-applied and live attributes for managed
//! resources, classifies each divergence, and plans (or applies) ordered
//! corrective actions under a partition lock.

pub mod diff;
pub mod lock;
pub mod output;
pub mod paths;
pub mod plan;
pub mod providers;
pub mod reconcile;
pub mod resource;
pub mod retry;
pub mod store;
pub mod terraform;

mod error;

pub use diff::{Divergence, DriftClass, ResourceDiff, diff_attributes, diff_resource};
pub use error::DriftError;
pub use plan::{ActionKind, ExternalDriftPolicy, Plan, PlanError, PlannedAction};
pub use providers::{Change, Provider, ProviderError};
pub use reconcile::{ReconcileReport, ReconciliationFailed, Reconciler, RunMode};
pub use resource::{
    AttributeValue, Attributes, DeclaredResource, LiveObservation, ProviderRefs, ReconcileConfig,
    ResourceRecord, load_declarations, parse_declarations,
};
