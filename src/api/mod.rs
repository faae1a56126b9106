// =============================================================================
// HTTP API
// =============================================================================

pub mod rest;

pub use rest::build_router;
