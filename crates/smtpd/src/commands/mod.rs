//! The SMTP command set, one module per verb family.
use rfc5321::{codes, dsn, Response};

pub mod connect;
pub mod data;
pub mod helo;
pub mod mail;
pub mod noop;
pub mod quit;
pub mod rcpt;
pub mod rset;
pub mod unsupported;

fn unexpected_argument(verb: &str) -> Response {
    Response::with_status(
        codes::SYNTAX_ERROR_ARGUMENTS,
        dsn::DELIVERY_INVALID_ARG,
        format!("Unexpected argument provided with {verb} command"),
    )
}

fn bad_sequence(message: &str) -> Response {
    Response::with_status(codes::BAD_SEQUENCE, dsn::DELIVERY_OTHER, message)
}
