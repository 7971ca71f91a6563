//! Core dispatch abstractions for quotio.
//!
//! This crate intentionally does **not** depend on axum or any concrete HTTP
//! client. Executors are handed opaque payloads and perform their own IO;
//! everything here is the credential model, the cooldown state machine, the
//! selection strategies, and the pool that ties them together.

pub mod credential;
pub mod errors;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod state;

pub use credential::{AuthStatus, StoredCredential, normalize_provider};
pub use errors::{ExecuteError, ExecuteErrorKind, PoolError};
pub use executor::{
    ChunkResult, ChunkStream, ExecuteOptions, ExecuteRequest, HttpRequestParts, ProviderExecutor,
    base_model_name,
};
pub use pool::{CredentialPool, CredentialSink, NoopSink, PoolConfig};
pub use registry::ExecutorRegistry;
pub use selector::{BlockReason, Eligibility, eligibility};
pub use state::{ExecutionResult, ModelState, QuotaState, RuntimeCredential, RuntimeStatus};
