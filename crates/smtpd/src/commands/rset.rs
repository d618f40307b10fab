use super::unexpected_argument;
use crate::dispatcher::{CommandOutcome, HookableCommand};
use crate::session::Session;
use rfc5321::{codes, dsn, Response};

pub struct RsetCmd;

impl HookableCommand for RsetCmd {
    type Argument = ();

    fn verbs(&self) -> &'static [&'static str] {
        &["RSET"]
    }

    fn pre_filter(&self, _: &Session, verb: &str, argument: Option<&str>) -> Result<(), Response> {
        match argument {
            Some(_) => Err(unexpected_argument(verb)),
            None => Ok(()),
        }
    }

    fn core_action(&self, session: &mut Session, _: &str, _: &()) -> CommandOutcome {
        session.reset_transaction();
        CommandOutcome::reply(Response::with_status(
            codes::MAIL_OK,
            dsn::UNDEFINED_STATUS,
            "OK",
        ))
    }
}

#[cfg(test)]
mod test {
    use crate::dispatcher::test::{base_registry, run};
    use crate::dispatcher::ProtocolChain;
    use crate::session::test::make_session;
    use k9::assert_equal;

    #[tokio::test]
    async fn rset_with_argument() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        assert_equal!(
            run(&dispatcher, &mut session, "RSET now").await,
            "501 5.5.4 Unexpected argument provided with RSET command\r\n"
        );
        assert_equal!(
            run(&dispatcher, &mut session, "NOOP whatever").await,
            "250 2.0.0 OK\r\n"
        );
    }
}
