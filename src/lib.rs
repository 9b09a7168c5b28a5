//! Stochastic simulation of pathogen evolution across a set of hosts.
//!
//! Every generation the [`Engine`] runs a fixed pipeline of stages over the
//! host list: mutation, transmission bottleneck, drug selection, drift,
//! recombination, migration and capacity regulation.

pub mod analysis;
pub mod config;
pub mod engine;
pub mod manager;
pub mod model;
pub mod stages;
pub mod stats;

pub use config::{Config, InitConfig, ModelConfig, OutputConfig};
pub use engine::Engine;
pub use model::{Host, Individual, Lineage, MutationTag};
pub use stats::StatsSnapshot;
