pub mod config;
pub mod message;

pub use config::*;
pub use message::*;
