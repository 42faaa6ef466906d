//! External collaborator boundaries: hypervisor control, packet capture,
//! static intel services and the persistent store. The core only ever sees
//! these trait surfaces; process and wire details stay behind them.

pub mod capture;
pub mod hypervisor;
pub mod intel;
pub mod store;

pub use capture::{CaptureClient, CaptureHandle};
pub use hypervisor::HypervisorClient;
pub use intel::{FuzzyHashClient, SignatureClient};
pub use store::ReportStoreClient;
