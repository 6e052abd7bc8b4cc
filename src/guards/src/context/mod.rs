//! User context loading
//!
//! Permission snapshots come from an external [`PermissionSource`], are
//! resolved by the configured strategy and cached per user by
//! [`UserContextService`].

mod registry;
mod service;
mod source;

pub use registry::PermissionRegistry;
pub use service::UserContextService;
pub use source::{InMemoryPermissionSource, PermissionSource};
