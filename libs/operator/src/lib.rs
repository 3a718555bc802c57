//! Faro's core event engine: discovers Kubernetes resources, maintains the
//! informers a declarative configuration demands, reacts to new CRDs at
//! runtime, funnels every watched change through a rate-limited queue, and
//! fans the resolved event out to in-process subscribers and an
//! append-only JSON sink.
//!
//! The [`engine`] module is the entry point embedders use
//! ([`engine::Engine`]); everything else is a component of it:
//!
//! | Component | Module |
//! |---|---|
//! | Resource Catalog | [`catalog`] |
//! | Configuration Normalizer | [`config`] |
//! | Informer Factory + Registry | [`informer`] |
//! | Work Queue + Worker Pool | [`queue`] |
//! | Reconciler | [`reconcile`] |
//! | CRD Adapter | [`crd_adapter`] |
//! | Event Dispatcher | [`dispatch`] |
//! | Engine Façade | [`engine`] |

pub mod catalog;
pub mod config;
pub mod crd_adapter;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod informer;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod reconcile;
pub mod telemetry;

pub use engine::{Engine, EngineState};
pub use error::{Error, Result};
pub use model::{EventKind, FilterRule, Gvr, JsonEvent, NormalizedEvent};
