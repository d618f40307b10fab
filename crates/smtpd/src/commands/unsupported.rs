use crate::dispatcher::{CommandOutcome, HookableCommand};
use crate::session::Session;
use rfc5321::{codes, dsn, Response};

/// Commands that are recognized but deliberately not implemented
pub struct UnsupportedCmd;

fn not_supported(verb: &str) -> Response {
    Response::with_status(
        codes::UNIMPLEMENTED_COMMAND,
        dsn::SYSTEM_NOT_CAPABLE,
        format!("{verb} is not supported"),
    )
}

impl HookableCommand for UnsupportedCmd {
    type Argument = ();

    fn verbs(&self) -> &'static [&'static str] {
        &["VRFY", "EXPN", "HELP"]
    }

    fn pre_filter(&self, _: &Session, verb: &str, _: Option<&str>) -> Result<(), Response> {
        Err(not_supported(verb))
    }

    fn core_action(&self, _: &mut Session, verb: &str, _: &()) -> CommandOutcome {
        CommandOutcome::reply(not_supported(verb))
    }
}

/// Handles any verb that has no registered handler
pub struct UnknownCmd;

fn unrecognized(verb: &str) -> Response {
    Response::with_status(
        codes::SYNTAX_ERROR_COMMAND_UNRECOGNIZED,
        dsn::DELIVERY_INVALID_CMD,
        format!("Command {verb} unrecognized."),
    )
}

impl HookableCommand for UnknownCmd {
    type Argument = ();

    fn verbs(&self) -> &'static [&'static str] {
        &[]
    }

    fn pre_filter(&self, _: &Session, verb: &str, _: Option<&str>) -> Result<(), Response> {
        Err(unrecognized(verb))
    }

    fn core_action(&self, _: &mut Session, verb: &str, _: &()) -> CommandOutcome {
        CommandOutcome::reply(unrecognized(verb))
    }
}
