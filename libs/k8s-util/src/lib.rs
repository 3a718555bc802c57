//! Transport-level helpers shared by any consumer of a [`kube::Client`].
//!
//! This crate carries no Faro-specific logic: it is the thin layer between
//! `kube` and the rest of the workspace, instrumenting the HTTP client with
//! Prometheus metrics the same way regardless of which component (the
//! resource catalog, an informer, the CRD adapter) is issuing the request.

pub mod client;
pub mod metrics;
pub mod url;
