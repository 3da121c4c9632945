// Library root: re-exports all modules so integration tests and the server
// binary can reach the crate's public API.

pub mod api;
pub mod broadcaster;
pub mod config;
pub mod http_api;
pub mod membership;
pub mod protocol;
pub mod room;
pub mod store;
pub mod ws_server;
