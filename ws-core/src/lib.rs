//! Foundation types shared by every workspace master crate.

pub mod error;
pub mod subject;

pub use error::{Result, WsError};
pub use subject::Subject;
