use crate::dispatcher::{CapabilityRequirement, CommandOutcome, HookableCommand};
use crate::hooks::{
    capability, is_terminal, CapabilityKind, EhloExtension, HeloHook, HookRegistry, HookResult,
};
use crate::session::{HeloInfo, HeloMode, Session};
use async_trait::async_trait;
use rfc5321::{codes, dsn, Domain, Response};
use std::sync::Arc;

const BUILTIN_EXTENSIONS: &[&str] = &["PIPELINING", "ENHANCEDSTATUSCODES", "8BITMIME"];

/// HELO and EHLO
#[derive(Default)]
pub struct HeloCmd {
    hooks: Vec<Arc<dyn HeloHook>>,
    extensions: Vec<Arc<dyn EhloExtension>>,
}

pub struct HeloArgument {
    pub mode: HeloMode,
    pub name: String,
}

#[async_trait]
impl HookableCommand for HeloCmd {
    type Argument = HeloArgument;

    fn verbs(&self) -> &'static [&'static str] {
        &["HELO", "EHLO"]
    }

    fn capabilities(&self) -> Vec<CapabilityRequirement> {
        vec![
            CapabilityRequirement::optional(CapabilityKind::Helo),
            CapabilityRequirement::optional(CapabilityKind::EhloExtension),
        ]
    }

    fn wire(&mut self, registry: &HookRegistry) {
        self.hooks = registry.hooks_for::<capability::Helo>();
        self.extensions = registry.hooks_for::<capability::Ehlo>();
    }

    fn pre_filter(
        &self,
        _session: &Session,
        verb: &str,
        argument: Option<&str>,
    ) -> Result<HeloArgument, Response> {
        let mode = if verb == "EHLO" {
            HeloMode::Ehlo
        } else {
            HeloMode::Helo
        };
        let name = argument.ok_or_else(|| {
            Response::with_status(
                codes::SYNTAX_ERROR_ARGUMENTS,
                dsn::DELIVERY_INVALID_ARG,
                format!("Domain address required: {verb}"),
            )
        })?;
        if Domain::parse(name).is_err() {
            return Err(Response::with_status(
                codes::SYNTAX_ERROR_ARGUMENTS,
                dsn::DELIVERY_INVALID_ARG,
                "Invalid domain",
            ));
        }
        Ok(HeloArgument {
            mode,
            name: name.to_string(),
        })
    }

    fn core_action(
        &self,
        session: &mut Session,
        _verb: &str,
        argument: &HeloArgument,
    ) -> CommandOutcome {
        session.reset_transaction();
        session.connection.helo = Some(HeloInfo {
            mode: argument.mode,
            name: argument.name.clone(),
        });

        let mut response = Response::plain(
            codes::MAIL_OK,
            format!(
                "{} Hello {} ({} [{}])",
                session.hello_name(),
                argument.name,
                session.remote_host,
                session.remote_ip()
            ),
        );
        if argument.mode == HeloMode::Ehlo {
            for ext in &self.extensions {
                for line in ext.extensions(session) {
                    response.push_line(line);
                }
            }
            for line in BUILTIN_EXTENSIONS {
                response.push_line(line);
            }
        }
        CommandOutcome::reply(response)
    }

    async fn hook_chain(
        &self,
        session: &mut Session,
        argument: &HeloArgument,
    ) -> Option<(CapabilityKind, HookResult)> {
        for hook in &self.hooks {
            let result = hook.on_helo(session, &argument.name).await;
            if is_terminal(CapabilityKind::Helo, &result) {
                return Some((CapabilityKind::Helo, result));
            }
        }
        None
    }

    fn post_process(&self, session: &mut Session, _argument: &HeloArgument, response: &Response) {
        if !response.is_success() {
            session.connection.helo = None;
        }
    }
}

#[cfg(test)]
mod test {
    use crate::dispatcher::test::{base_registry, run};
    use crate::dispatcher::ProtocolChain;
    use crate::hooks::{capability, EhloExtension};
    use crate::session::test::make_session;
    use crate::session::{HeloMode, Session};
    use k9::assert_equal;
    use std::sync::Arc;

    struct Chunking;
    impl EhloExtension for Chunking {
        fn extensions(&self, _session: &Session) -> Vec<String> {
            vec!["CHUNKING".to_string()]
        }
    }

    #[tokio::test]
    async fn helo_and_ehlo() {
        let mut registry = base_registry();
        registry.register::<capability::Ehlo>(Arc::new(Chunking));
        let dispatcher = ProtocolChain::smtp().build(&registry, &[]).unwrap();
        let mut session = make_session(false);

        assert_equal!(
            run(&dispatcher, &mut session, "HELO").await,
            "501 5.5.4 Domain address required: HELO\r\n"
        );
        assert_equal!(
            run(&dispatcher, &mut session, "EHLO bad..name").await,
            "501 5.5.4 Invalid domain\r\n"
        );
        assert!(session.connection.helo.is_none());

        assert_equal!(
            run(&dispatcher, &mut session, "HELO client").await,
            "250 mx.example.com Hello client (client.example.net [192.0.2.1])\r\n"
        );
        assert_equal!(
            session.connection.helo.as_ref().map(|h| h.mode),
            Some(HeloMode::Helo)
        );

        assert_equal!(
            run(&dispatcher, &mut session, "ehlo [192.0.2.1]").await,
            "250-mx.example.com Hello [192.0.2.1] (client.example.net [192.0.2.1])\r\n\
             250-CHUNKING\r\n\
             250-PIPELINING\r\n\
             250-ENHANCEDSTATUSCODES\r\n\
             250 8BITMIME\r\n"
        );
        assert_equal!(
            session.connection.helo.as_ref().map(|h| h.mode),
            Some(HeloMode::Ehlo)
        );
    }
}
