pub mod reset;

pub use reset::{perform_reset, RebootReason, ResetError};
