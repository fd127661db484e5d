//! Testing Utilities Module
//!
//! ## Submodules
//!
//! - `mock_deposits` - deposit and batch builders
//! - `assertions` - batch outcome assertions

pub mod assertions;
pub mod mock_deposits;

// Re-export commonly used items
pub use assertions::*;
pub use mock_deposits::*;
