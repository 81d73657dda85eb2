//! Request-path middleware: request-id stamping and the CSRF/body-size
//! entry guard. Both run before the dispatcher sees the request.

pub mod guard;

pub use guard::{guard_middleware, request_id_middleware, GuardConfig};
