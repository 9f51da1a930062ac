//! Prelude module for common imports.
//!
//! This module re-exports commonly used types and traits for convenience.
//!
//! # Usage
//!
//! ```ignore
//! use quarry::prelude::*;
//! ```

// Error types
pub use crate::error::{DbError, ProtocolError, QuarryError, Result};

// Configuration
pub use crate::config::{Config, ExpireConfig, KvConfig, RateLimitConfig, ServerConfig, StatusConfig};

// Data layer
pub use crate::db::{DbHandle, DbId, Transaction};

// Store
pub use crate::store::{KvTransaction, MemStore, Store};

// Protocol
pub use crate::protocol::{Reply, ReplyWriter};

// Server
pub use crate::server::{AppState, Server};

// Common external crates
pub use std::sync::Arc;
pub use tracing::{debug, error, info, trace, warn};
