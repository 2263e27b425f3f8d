//! Boundary collaborators: the member web API, sibling resource lookups and
//! credential secrets

mod linked_resources;
mod secrets;
mod status_client;

pub use linked_resources::*;
pub use secrets::*;
pub use status_client::*;
