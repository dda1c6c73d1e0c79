// Core modules
pub mod criu;
pub mod error;
pub mod images;
pub mod proto;

pub use error::{Result, XferError};
