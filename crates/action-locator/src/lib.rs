//! Query resolution across frames
//!
//! This crate turns a caller query into exactly one element:
//! - Query model and option validation
//! - In-page operation catalogue evaluated in isolated worlds
//! - Frame index for global/local match index translation
//! - Selection policy and multi-frame resolver
//! - Explain (dry-run of the selection policy)

pub mod errors;
pub mod explain;
pub mod frame_index;
pub mod ops;
pub mod resolver;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use errors::*;
pub use explain::*;
pub use frame_index::*;
pub use resolver::*;
pub use types::*;
