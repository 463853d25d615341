pub mod config;
pub mod error;
pub mod files;
pub mod locator;
pub mod notify;
pub mod reconcile;
pub mod records;
pub mod rpc;
pub mod session;
pub mod supervisor;
pub mod task;
pub mod time;
pub mod timer;

#[cfg(test)]
mod fake;

pub use error::{RpcError, SupervisorError};
