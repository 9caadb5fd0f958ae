pub mod manifest;
pub mod template;

pub use manifest::{Manifest, TimelineEntry, Track};
