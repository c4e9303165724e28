//! Dashboard export: JSON endpoints over the flow graph (Axum).

pub mod router;
pub mod server;

pub use server::run_dashboard;
