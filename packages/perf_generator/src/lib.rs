pub mod batcher;
pub mod collector;
pub mod config;
pub mod converter;
pub mod crypto;
pub mod errors;
pub mod gate;
pub mod generator;
pub mod metrics;
pub mod model;
pub mod ports;
pub mod producer;
pub mod queue;

pub use collector::{CollectorPool, CollectorResultCode, ResponseMessage, TransactionStatus};
pub use config::{CollectorConfig, GeneratorConfig};
pub use generator::{PerformanceGenerator, PerformanceGeneratorBuilder};
pub use metrics::Counters;

#[cfg(test)]
mod tests;
