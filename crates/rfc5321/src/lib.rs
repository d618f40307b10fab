//! Wire vocabulary for the server side of RFC 5321: splitting command
//! lines into verbs and arguments, parsing envelope paths and ESMTP
//! parameters, and encoding replies with enhanced status codes.
pub mod parser;
pub mod response;

pub use parser::*;
pub use response::*;
