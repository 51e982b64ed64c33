//! HTTP session-management surface and the websocket upgrade handshake.

pub mod handlers;
pub mod routes;
pub mod ws;
