//! # Mail synchronization core.
//!
//! Reconciles server-side IMAP mailbox state with a local SQLite store,
//! threads messages, indexes them for search, and replays client-initiated
//! mutations against the server through a task queue.
//!
//! Three actors run per account: a background worker sweeping every folder,
//! a foreground worker idling on the inbox and draining the task queue, and
//! the supervisor's listener feeding client frames in over stdio. The store
//! is shared; IMAP sessions are not.

#![warn(clippy::correctness)]

pub mod account;
pub mod comm_stream;
pub mod contact;
pub mod error;
pub mod folder;
pub mod imap;
pub mod message;
pub mod processor;
pub mod smtp;
pub mod store;
pub mod sync_worker;
pub mod task;
pub mod task_processor;
pub mod thread;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_utils;
