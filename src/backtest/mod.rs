pub mod executor;
pub mod metrics;

pub use executor::BacktestExecutor;
pub use metrics::compute_metrics;
