//! Dispatch facade and application state: resolves inbound model names to
//! provider fallback chains, drives the credential pool, and renders pool
//! failures as HTTP-shaped errors.

pub mod auth;
pub mod error;
pub mod facade;
pub mod state;

pub use auth::ApiKeyAuth;
pub use error::ProxyError;
pub use facade::{DispatchFacade, DispatchOutcome, DispatchPlan};
pub use state::AppState;
