pub mod algorithms;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod metrics;
pub mod middleware;
pub mod rate_limit_config;
pub mod redis;
pub mod response;
pub mod rule_matcher;
pub mod server;
pub mod store;
pub mod throttler;
pub mod validation;

pub use algorithms::Decision;
pub use config::Config;
pub use error::{ThrottlerError, ThrottlerResult};
pub use middleware::{rate_limit_middleware, AuthenticatedUser, RequestDeadline};
pub use rate_limit_config::{RateLimitConfig, RateLimitRule, Strategy, Window};
pub use crate::redis::RedisCounterStore;
pub use server::create_app;
pub use store::{CounterStore, MemoryCounterStore};
pub use throttler::{Admission, Throttler};
