//! Background cache manager.
//!
//! Runs outside any page: installs a versioned cache, garbage-collects old
//! versions on activation, intercepts same-origin GET requests and answers
//! the conversation snapshot protocol. All durable state lives in the cache
//! store, so a manager can be dropped and started again at any time.

mod clients;
mod manager;
mod network;
mod registration;
mod request;

pub use clients::ClientConnection;
#[cfg(test)]
pub use clients::Clients;
pub use manager::ManagerConfig;
pub use network::{HttpNetwork, Network};
pub use registration::{LocalRegistrar, ManagerHandle, Registrar};
#[cfg(test)]
pub use registration::ManagerEvent;
pub use request::Request;
