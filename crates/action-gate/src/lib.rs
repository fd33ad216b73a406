//! Post-action evidence
//!
//! - Page state capture (url, title, focus, landmark role counts)
//! - Before/after delta with ARIA attribute tracking on the acted-on element
//! - Caller assertions
//! - Proof envelope

pub mod assertions;
pub mod evidence;
pub mod proof;
pub mod types;

pub use assertions::{check, evaluate};
pub use evidence::*;
pub use proof::*;
pub use types::*;
