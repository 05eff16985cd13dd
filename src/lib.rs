pub mod core;
pub mod engine;
pub mod utils;

pub use crate::core::{
    config::{ConnectionConfig, Market, SessionTimeouts, TrustStore},
    errors::{ExchangeError, Phase},
    types::*,
};
pub use engine::{Engine, EngineBuilder};
