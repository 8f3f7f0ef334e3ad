pub mod metrics;
pub mod tracing_mw;
