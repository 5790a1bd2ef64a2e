#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;

pub use client::Client;
pub use config::Config;
pub use connection::ConnectionState;
pub use error::{Error, Kind, SendError};
pub use events::{Event, EventType, HandlerRegistry};

pub type Result<T> = std::result::Result<T, Error>;
