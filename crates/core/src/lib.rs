pub mod config;
pub mod error;
pub mod filter;
pub mod ids;
pub mod model;
pub mod normalize;
pub mod query;
pub mod time;

pub use error::{OtqError, Result};
