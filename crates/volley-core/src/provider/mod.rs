//! Provider ports and the single-flight gate in front of them.

pub mod gateway;
pub mod port;
pub mod store;
