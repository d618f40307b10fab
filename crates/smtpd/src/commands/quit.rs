use super::unexpected_argument;
use crate::dispatcher::{CommandOutcome, HookableCommand, NextAction};
use crate::session::Session;
use rfc5321::{codes, dsn, Response};

pub struct QuitCmd;

impl HookableCommand for QuitCmd {
    type Argument = ();

    fn verbs(&self) -> &'static [&'static str] {
        &["QUIT"]
    }

    fn pre_filter(&self, _: &Session, verb: &str, argument: Option<&str>) -> Result<(), Response> {
        match argument {
            Some(_) => Err(unexpected_argument(verb)),
            None => Ok(()),
        }
    }

    fn core_action(&self, session: &mut Session, _: &str, _: &()) -> CommandOutcome {
        CommandOutcome::with_action(
            Response::with_status(
                codes::SYSTEM_QUIT,
                dsn::UNDEFINED_STATUS,
                format!(
                    "{} Service closing transmission channel",
                    session.hello_name()
                ),
            ),
            NextAction::Disconnect,
        )
    }
}

#[cfg(test)]
mod test {
    use crate::dispatcher::test::base_registry;
    use crate::dispatcher::{NextAction, ProtocolChain};
    use crate::session::test::make_session;
    use k9::assert_equal;

    #[tokio::test]
    async fn quit_disconnects() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        let outcome = dispatcher.dispatch(&mut session, "quit").await;
        assert_equal!(outcome.action, NextAction::Disconnect);
        assert_equal!(
            outcome.response.to_wire(),
            "221 2.0.0 mx.example.com Service closing transmission channel\r\n"
        );

        let outcome = dispatcher.dispatch(&mut session, "QUIT now").await;
        assert_equal!(outcome.action, NextAction::Continue);
        assert!(outcome.response.is_permanent());
    }
}
