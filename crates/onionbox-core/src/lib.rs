pub mod config;
pub mod error;

pub use error::{BoxError, BoxResult, ErrorKind};
