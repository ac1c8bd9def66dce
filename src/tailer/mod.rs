// SPDX-License-Identifier: Apache-2.0

//! Container log tailer.
//!
//! Discovers `*.log` files under the configured roots, follows each one
//! from its own task and records read positions in a shared
//! [`store::PositionStore`], which the [`persister::Persister`] checkpoints
//! to disk.

pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod file_id;
pub mod finder;
pub mod follower;
pub mod metadata;
pub mod persister;
pub mod reader;
pub mod store;
pub mod watcher;

pub use config::TailerConfig;
pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use persister::{Persister, PersisterConfig};
pub use store::{PositionStore, SharedPositionStore};
