pub mod access;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod io;
pub mod lock;
pub mod registry;
pub mod retry;
pub mod sanitize;
pub mod spawner;
pub mod store;
pub mod types;

#[cfg(test)]
mod testing;

pub use controller::{ControllerSettings, LifecycleController};
pub use error::{ClusterError, Result};
