//! Action pipeline and executors
//!
//! - Request validation into an executable plan
//! - One executor per verb, composed with the query resolver
//! - Wait-after-action budget shared by every verb
//! - Report assembly with evidence, proof and four-phase timing

mod pipeline;
mod primitives;
pub mod report;
pub mod request;
pub mod types;
mod waiting;

pub use pipeline::{ActionPipeline, ChromiumConnector, Connector};
pub use primitives::*;
pub use report::*;
pub use request::*;
pub use types::*;
pub use waiting::*;
