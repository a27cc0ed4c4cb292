pub mod audit;
pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod inventory;
pub mod io;
pub mod paths;
pub mod plan;
pub mod text;
pub mod tracker;
pub mod types;

pub use error::{ErrorKind, Result, TreError};
