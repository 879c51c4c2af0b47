pub mod connection;
pub mod handler;
pub mod message;
pub mod persistence;
pub mod registry;
pub mod router;
pub mod session;
pub mod supervisor;
