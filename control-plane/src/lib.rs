pub mod api;
pub mod config;
pub mod db;
pub mod services;
pub mod state;

pub use config::ManagerConfig;
pub use db::{Database, DbError};
pub use state::AppState;
