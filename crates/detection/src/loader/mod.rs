//! Filesystem policy loader with hot-reload via a `notify` watcher.
//!
//! Policies live as YAML documents under one directory tree. The loader keeps
//! the parsed documents in memory, doubles as a [`PolicyStore`](crate::store::PolicyStore),
//! and reports file changes as [`PolicyEvent`]s.

mod core;
mod error;
mod watcher;

#[cfg(test)]
mod tests;

pub use self::core::PolicyLoader;
pub use self::error::{LoadResult, LoadStatus, LoaderError, Result};
pub use self::watcher::PolicyEvent;
