pub mod attrs;
pub mod record;

pub use attrs::{AttrMap, AttrValue};
pub use record::Record;
