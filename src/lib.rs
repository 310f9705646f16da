//! Portkite - a sidecar TCP ambassador for containerized services
//!
//! This library provides a local "ambassador" proxy that:
//! - Discovers the running instances of a named container within an ECS
//!   task family or service
//! - Listens locally on every port that container exposes
//! - Randomly load-balances each inbound connection across the currently
//!   known backend addresses for that port
//! - Hot-swaps backend lists as tasks come and go, without disturbing
//!   connections that are already established
//! - Tears down listeners (and force-closes their connections) for ports
//!   that disappear from the task topology

pub mod aws;
pub mod discovery;
pub mod error;
pub mod proxy;
pub mod reconcile;
pub mod topology;
