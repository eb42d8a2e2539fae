pub mod error;
pub mod fsutil;
pub mod platform;

pub use error::{Result, VeaError, VeaErrorKind};
