//! Public interface to the ballast library: the replica-team placement
//! controller of a distributed key-value store.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

pub mod collection;
pub mod external;
pub mod model;
pub mod policy;

pub use utils::{BallastError, RestTimer};
