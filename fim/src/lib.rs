//! File integrity monitor for account and access files, driven by kernel
//! write and rename notifications.

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod probe;
pub mod process;
pub mod setup;
pub mod store;
pub mod watch_gap;
pub mod watch_table;

#[cfg(test)]
pub(crate) mod testing;
