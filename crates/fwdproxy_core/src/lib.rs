//! Accept loop, connection admission, and HTTP/1.1 forward-proxy request
//! parsing — the pieces that sit in front of the forwarder.

pub mod listener;
pub mod worker;

pub use listener::Listener;
