//! The czar: user-query controller binding rewrite, dispatch and merge to
//! one logical query id.
//!
//! Key modules:
//! - [`controller`]: submit/kill API and the per-query drive loop
//! - [`user_query`]: the user-query record and state machine
//! - [`message_table`]: the client-visible message ledger
//! - [`grpc`]: control service consumed by the MySQL-protocol shim

pub mod controller;
pub mod grpc;
pub mod message_table;
pub mod user_query;

#[cfg(test)]
mod controller_tests;

pub use controller::{parse_kill_token, Czar, SubmitResult};
pub use message_table::{MessageTable, QueryMessage, Severity};
pub use user_query::{UserQuery, UserQueryState};
