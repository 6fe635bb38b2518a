pub mod ci;
pub mod config;
pub mod conflict;
pub mod error;
pub mod notify;
pub mod output;
pub mod pipeline;
pub mod registry;
pub mod run;
pub mod store;
pub mod webhook;
pub mod workspace;

pub use error::{Error, Result};
