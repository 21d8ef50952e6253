pub mod cli;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod dispatch;
pub mod handoff;
pub mod identifiers;
pub mod logger;
pub mod lookup;
pub mod rate_limit;
pub mod result_sink;
pub mod retry;
pub mod stats;
pub mod store;

pub use coordinator::{Coordinator, CoordinatorConfig, ShutdownGuard};
pub use credentials::{Credential, CredentialError, CredentialPool, CredentialSet};
pub use dispatch::{DispatchConfig, DispatchEngine, DispatchError, DispatchReport};
pub use lookup::{LookupApi, LookupResponse, ProfileDecoder, ProfileRecord};
pub use retry::{RetryConfig, RetryController, RetryReport, RetryStop};
pub use stats::{RunOutcome, RunStats, RunSummary};
pub use store::{IdentifierStatus, StoreError, WorkQueue};
