use crate::dispatcher::{CommandOutcome, HookableCommand};
use crate::session::Session;
use rfc5321::{codes, dsn, Response};

/// NOOP accepts and ignores any argument
pub struct NoopCmd;

impl HookableCommand for NoopCmd {
    type Argument = ();

    fn verbs(&self) -> &'static [&'static str] {
        &["NOOP"]
    }

    fn pre_filter(&self, _: &Session, _: &str, _: Option<&str>) -> Result<(), Response> {
        Ok(())
    }

    fn core_action(&self, _: &mut Session, _: &str, _: &()) -> CommandOutcome {
        CommandOutcome::reply(Response::with_status(
            codes::MAIL_OK,
            dsn::UNDEFINED_STATUS,
            "OK",
        ))
    }
}
