// Library interface for geoflow
// The binary and the integration tests both build on these modules.

pub mod cache;
pub mod config;
pub mod config_discovery;
pub mod eval;
pub mod expr;
pub mod logging;
pub mod period;

// Re-export commonly used types
pub use cache::{default_cache_dir, CacheError, CacheOptions, CacheStore};
pub use config::GeoflowConfig;
pub use config_discovery::discover_config;
pub use eval::{EvalError, EvalOptions, Evaluated, Evaluator};
pub use expr::{ExprError, Node, Registry};
pub use period::{Period, PeriodError};
