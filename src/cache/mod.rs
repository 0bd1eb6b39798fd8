//! Read-through cache of the organization's upstream resources.
//!
//! The refresh workers in [`scheduler`] keep the store populated through a
//! [`CacheManager`]; the repository worker hands each persisted snapshot to
//! the [`ViewBuilder`] through the [`gate`], which precomputes the
//! top-repository views served under `/view/top/...`.

pub mod error;
pub mod gate;
pub mod manager;
pub mod model;
pub mod scheduler;
pub mod views;

pub use error::CacheError;
pub use manager::CacheManager;
pub use model::{CachedResource, Repository};
pub use views::{ViewBuilder, ViewKey};
