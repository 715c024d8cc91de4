//! Local reference implementation of [`crate::store::ImageStore`].

pub mod layer;
mod local;

pub use layer::{DirSnapshot, LayerChanges, LayerInfo};
pub use local::LocalStore;
