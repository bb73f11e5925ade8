//! Core of the RIoTPot dashboard: local registries of services, profiles and
//! instances, and reconciliation of each instance's proxies against its API.

pub mod config;
pub mod db;
pub mod error;
pub mod reconcile;
pub mod remote;
pub mod routes;
pub mod snapshot;
pub mod state;
pub mod store;
pub mod toast;
pub mod validate;

pub use error::{DashboardError, RemoteError, Result, StoreError};
pub use remote::{ProxyApi, RemoteClient};
pub use state::AppState;
