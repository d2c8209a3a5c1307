//! Line-delimited JSON protocol. Each handler family claims its methods via
//! `try_handle`; the router tries them in order.

mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
