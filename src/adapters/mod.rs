//! Adapters to the external collaborators: the cluster API, the events API
//! and storage secrets.

mod cluster;
mod events;
mod secrets;

pub use cluster::*;
pub use events::*;
pub use secrets::*;
