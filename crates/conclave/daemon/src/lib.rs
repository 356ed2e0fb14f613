//! Conclave daemon library
//!
//! The HTTP surface over the substrate, the server lifecycle and the
//! operator commands behind `conclaved`.

pub mod api;
pub mod cli;
pub mod error;
pub mod server;

pub use api::{create_router, AppState};
pub use cli::{Cli, Command};
pub use error::{ApiError, DaemonError};
pub use server::Server;
