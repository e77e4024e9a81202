pub mod analysis;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logger;
pub mod repository;
pub mod usecase;
pub mod webhook;

pub use error::{ErrorCode, GatewayError, Result};
pub use gateway::{Gateway, GatewayConfig, InboundOutcome};
