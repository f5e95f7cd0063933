pub mod api;
pub mod arbiter;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod fair;
pub mod net;
pub mod store;
pub mod types;

pub use auth::AuthService;
pub use config::Config;
pub use engine::{Engine, EngineConfig, EngineHandle};
pub use error::{Error, Result};
pub use fair::FairnessOracle;
pub use net::{BroadcastFabric, SessionRegistry};
pub use store::Store;
pub use types::*;
