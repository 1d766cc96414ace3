//! Rate-limit-aware access to the GitHub REST API.
//!
//! [`scheduler::Scheduler`] owns every outbound call; [`http::GitHubClient`]
//! is the thin facade that builds requests and submits them to it.

pub mod config;
pub mod error;
pub mod http;
pub mod scheduler;
pub mod types;

pub use config::{Config, SchedulerConfig};
pub use error::{ConfigError, SchedulerError};
pub use scheduler::{Priority, RequestDescriptor, ResponseFuture, Scheduler};
