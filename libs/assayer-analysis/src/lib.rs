pub mod merge;
pub mod metrics;
pub mod robustness;
pub mod stats;
pub mod tables;
