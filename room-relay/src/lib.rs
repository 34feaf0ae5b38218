//! Real-time room relay over websockets.
//!
//! Clients join a named room through `/ws?room=..&username=..` and exchange
//! text messages; the server announces joins, leaves and the room roster.
//! Each module focuses on a concrete responsibility:
//!
//! - [`hub`] owns the room table, serializes membership changes and fans
//!   every queued message out to the members of its room.
//! - [`room`] and [`member`] are the data the hub works on: a room is a set of
//!   member handles, a member is anything implementing [`member::Member`].
//! - [`connection`] adapts a live websocket into a member, running the read
//!   and write pumps with heartbeats, idle timeouts and write deadlines.
//! - [`message`] and [`wire`] describe the events and their two wire variants
//!   (JSON objects or plain text lines).
//! - [`server`] wires the hub into an axum router with static files and
//!   graceful shutdown; [`config`] and [`cli`] hold its tunables.
//! - [`client`] is a terminal client for manual testing.
//!
//! Integration tests drive the hub through a channel-backed test double and
//! the server through real websocket clients.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod hub;
pub mod member;
pub mod message;
pub mod room;
pub mod server;
pub mod wire;
