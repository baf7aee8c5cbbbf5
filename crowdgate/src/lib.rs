//! Resilient crowd-density analysis over rate-limited upstream APIs.
//!
//! This crate keeps returning crowd-density estimates even when the upstream
//! vision/maps APIs are rate-limited, failing, or slow:
//! - Multi-level time-bucketed caching (fresh / medium / long tiers)
//! - Per-service circuit breakers with half-open probing
//! - API-key rotation with sliding-window quotas and temporary blacklisting
//! - Request batching into combined multi-part upstream calls
//! - A non-networked fallback chain that cannot fail
//!
//! # Example
//! ```ignore
//! use crowdgate::{CrowdAnalyzer, MitigationConfig};
//!
//! let analyzer = CrowdAnalyzer::from_env()?;
//!
//! // Always returns a well-formed result, never an error or a 429.
//! let result = analyzer
//!     .get_crowd_density(frame_bytes, Some((28.6139, 77.2090)))
//!     .await;
//! println!("{} people ({})", result.people_count, result.crowd_level.as_str());
//! ```

pub mod analyzer;
pub mod batch;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod keys;
pub mod rate;
pub mod types;
pub mod upstream;

// Re-export commonly used types
pub use analyzer::CrowdAnalyzer;
pub use batch::{BatchCoordinator, BatchStatsSnapshot, ResultHandle};
pub use breaker::{CircuitBreaker, CircuitSnapshot};
pub use cache::{CacheTier, MultiLevelCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BatchConfig, BreakerConfig, CacheConfig, EmergencyConfig, MitigationConfig, ServiceConfig,
};
pub use dispatch::UpstreamDispatcher;
pub use error::{MitigationError, Result};
pub use fallback::{FallbackContext, FallbackEstimator};
pub use keys::{KeyRotator, SelectedKey};
pub use rate::RateTracker;
pub use types::*;
pub use upstream::{
    MockUpstreamClient, ReqwestUpstreamClient, UpstreamClient, UpstreamRequest, UpstreamResponse,
};
