//! Certificate lifecycle: states, the state store and the manager that
//! moves certificates between them.

pub mod manager;
pub mod state;
pub mod store;

pub use manager::{ExpiryCheck, LifecycleManager, RecoveryAuthMethod, RenewalCheck, SweepReport};
pub use state::{CertificateLifecycleState, CertificateState};
pub use store::LifecycleStateStore;
