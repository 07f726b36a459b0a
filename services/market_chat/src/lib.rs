//! Two-party project conversations between a project owner and a tester:
//! directory, live message feed, attachments and the per-client session.

pub mod api;
pub mod attachments;
pub mod auth;
pub mod clock;
pub mod config;
pub mod conversations;
pub mod db;
pub mod directory;
pub mod error;
pub mod feed;
pub mod housekeeping;
pub mod messages;
pub mod model;
pub mod service;
pub mod session;
pub mod ws;

#[cfg(test)]
mod test_support;
