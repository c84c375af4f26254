#![deny(warnings)]
#![deny(clippy::all)]

pub mod buffer;
pub mod checkpoints;
pub mod config;
pub mod fields;
pub mod notify_cmd;
pub mod pingback;
pub mod producer;
pub mod reader;
pub mod receiver;
pub mod record;
pub mod script;
pub mod shared;
pub mod supervisor;
pub mod transform;
pub mod watcher;

pub use self::{
    buffer::LineBuffer,
    checkpoints::OffsetTable,
    config::{Config, FileSpec, MainConfig, StartFrom},
    record::{Record, RecordBatch},
    shared::{RunStatus, Shared},
};
