//! Desired child objects of an app and the engine that syncs them

mod builder;
mod components;
mod sync;

pub use builder::*;
pub use components::*;
pub use sync::*;
