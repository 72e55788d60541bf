//! The three lifecycle hooks (install, fetch, activate) and the registration that drives them.

pub mod collector;
pub mod installer;
pub mod lifecycle;
pub mod manifest;
pub mod registration;
pub mod router;

pub use collector::{on_activate, ActivateOptions, ActivationReport};
pub use installer::{on_install, InstallOptions, InstallReport};
pub use lifecycle::{ClientId, WorkerState};
pub use manifest::{AssetManifest, CacheVersion};
pub use registration::{Deployment, Registration, Status, WorkerInfo};
pub use router::{
  classify, on_fetch, Disposition, Exclusions, HostMatch, PassThroughReason, ResponseSource,
  RoutePolicy, Served,
};
