#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod blueprint;
pub mod config;
mod core;
mod engine;
mod error;
pub mod executor;
pub mod gateway;
mod locks;
pub mod release;
mod utils;
pub mod workspace;

pub use crate::blueprint::{Blueprint, TaskBinder, TaskDef, TaskGraph};
pub use crate::core::{Environment, Hash32, Mode, Settings, TaskContext};
pub use crate::engine::Handle;
pub use crate::error::*;
pub use crate::executor::{CancelToken, IncrementalExecutor, NodeStatus, Run, RunReport};
pub use crate::release::{Orchestrator, ReleaseRun, Services, discover};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
