//! Domain services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Services own room state, history and delivery so route handlers stay
//! focused on protocol translation. Nothing here touches a socket.

pub mod batcher;
pub mod broadcast;
pub mod connection;
pub mod cursor;
pub mod drawing;
pub mod history;
pub mod room;
pub mod sync;
