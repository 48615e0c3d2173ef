//! HTTP front end for the call center dispatch core

pub mod cli;
pub mod routes;

pub use cli::Args;
pub use routes::router;
