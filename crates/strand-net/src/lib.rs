//! # strand-net
//!
//! TCP layer for the strand coroutine runtime.
//!
//! Two surfaces over the same hooked-syscall core:
//!
//! - **Coroutine-blocking**: [`CoTcpListener`] / [`CoTcpConnection`] give
//!   a Go-like model where `recv` and `send` look blocking but suspend
//!   only the calling coroutine.
//! - **Callback-style**: [`CoTcpServer`] keeps the classic
//!   connection/message/write-complete/high-water-mark callback surface
//!   for reactor-style users, driven internally by coroutines.

pub mod connection;
pub mod listener;
pub mod server;
pub mod socket;

pub use connection::{CoTcpConnection, ConnHandle};
pub use listener::CoTcpListener;
pub use server::CoTcpServer;
