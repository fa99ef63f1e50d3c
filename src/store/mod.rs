//! Persistent directory back end.

pub mod db;
pub mod handler;

pub use db::{DirStore, ModifyOp, StoreOptions, StoreScope};
pub use handler::{StoreHandler, StoreHandlerOptions};
