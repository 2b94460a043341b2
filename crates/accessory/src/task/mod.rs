//! Tasks and their tags

mod model;
mod tag;

pub use model::{fields, Task};
pub use tag::{Tag, TagType, TagValue};
