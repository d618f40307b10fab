use super::bad_sequence;
use crate::dispatcher::{CapabilityRequirement, CommandOutcome, HookableCommand};
use crate::hooks::{
    capability, is_terminal, CapabilityKind, HookRegistry, HookResult, MailHook,
    MailParametersHook,
};
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::{codes, dsn, EsmtpParameter, ParseError, PathArgument, Response, ReversePath};
use std::sync::Arc;

#[derive(Default)]
pub struct MailCmd {
    param_hooks: Vec<Arc<dyn MailParametersHook>>,
    hooks: Vec<Arc<dyn MailHook>>,
}

pub struct MailArgument {
    pub sender: ReversePath,
    pub parameters: Vec<EsmtpParameter>,
}

fn usage() -> Response {
    Response::with_status(
        codes::SYNTAX_ERROR_ARGUMENTS,
        dsn::DELIVERY_INVALID_ARG,
        "Usage: MAIL FROM:<sender>",
    )
}

fn syntax_error(message: &str) -> Response {
    Response::with_status(
        codes::SYNTAX_ERROR_ARGUMENTS,
        dsn::ADDRESS_SYNTAX_SENDER,
        message,
    )
}

/// Append the default domain to a bare local part
pub(crate) fn qualify(path: &str, default_domain: &str) -> String {
    if path.is_empty() || path.contains('@') {
        path.to_string()
    } else {
        format!("{path}@{default_domain}")
    }
}

#[async_trait]
impl HookableCommand for MailCmd {
    type Argument = MailArgument;

    fn verbs(&self) -> &'static [&'static str] {
        &["MAIL"]
    }

    fn capabilities(&self) -> Vec<CapabilityRequirement> {
        vec![
            CapabilityRequirement::optional(CapabilityKind::MailParameters),
            CapabilityRequirement::optional(CapabilityKind::Mail),
        ]
    }

    fn wire(&mut self, registry: &HookRegistry) {
        self.param_hooks = registry.hooks_for::<capability::MailParameters>();
        self.hooks = registry.hooks_for::<capability::Mail>();
    }

    fn pre_filter(
        &self,
        session: &Session,
        _verb: &str,
        argument: Option<&str>,
    ) -> Result<MailArgument, Response> {
        if session.transaction.sender.is_some() {
            return Err(bad_sequence("Sender already specified"));
        }
        if session.settings.helo_ehlo_enforcement && session.connection.helo.is_none() {
            return Err(bad_sequence("Need HELO or EHLO before MAIL"));
        }
        let argument = argument.ok_or_else(usage)?;

        let parsed = match PathArgument::parse("FROM", argument) {
            Ok(parsed) => parsed,
            Err(ParseError::MissingKeyword(_)) => return Err(usage()),
            Err(ParseError::InvalidParameter(param)) => {
                tracing::debug!("invalid MAIL parameter {param:?}");
                return Err(Response::with_status(
                    codes::SYNTAX_ERROR_ARGUMENTS,
                    dsn::DELIVERY_INVALID_ARG,
                    "Syntax error in parameters or arguments",
                ));
            }
            Err(_) => return Err(syntax_error("Syntax error in MAIL command")),
        };
        if !parsed.bracketed {
            if session.settings.address_brackets_enforcement {
                return Err(syntax_error("Syntax error in MAIL command"));
            }
            if parsed.path.is_empty() {
                return Err(usage());
            }
        }

        let path = qualify(&parsed.path, &session.settings.default_domain);
        let sender = ReversePath::parse(&path)
            .map_err(|_| syntax_error("Syntax error in sender address"))?;

        Ok(MailArgument {
            sender,
            parameters: parsed.parameters,
        })
    }

    fn core_action(
        &self,
        session: &mut Session,
        _verb: &str,
        argument: &MailArgument,
    ) -> CommandOutcome {
        session.transaction.sender = Some(argument.sender.clone());
        CommandOutcome::reply(Response::with_status(
            codes::MAIL_OK,
            dsn::ADDRESS_OTHER,
            format!("Sender <{}> OK", argument.sender),
        ))
    }

    async fn hook_chain(
        &self,
        session: &mut Session,
        argument: &MailArgument,
    ) -> Option<(CapabilityKind, HookResult)> {
        for param in &argument.parameters {
            let mut recognized = false;
            for hook in &self.param_hooks {
                if !hook
                    .param_names()
                    .iter()
                    .any(|name| name.eq_ignore_ascii_case(&param.name))
                {
                    continue;
                }
                recognized = true;
                let result = hook
                    .on_parameter(session, &param.name, param.value.as_deref())
                    .await;
                if is_terminal(CapabilityKind::MailParameters, &result) {
                    return Some((CapabilityKind::MailParameters, result));
                }
            }
            if !recognized {
                tracing::debug!("ignoring unrecognized MAIL parameter {param}");
            }
        }

        for hook in &self.hooks {
            let result = hook.on_mail(session, &argument.sender).await;
            if is_terminal(CapabilityKind::Mail, &result) {
                return Some((CapabilityKind::Mail, result));
            }
        }
        None
    }

    fn post_process(&self, session: &mut Session, _argument: &MailArgument, response: &Response) {
        if !response.is_success() {
            session.transaction.sender = None;
            session.transaction.declared_size = None;
        }
    }
}

#[cfg(test)]
mod test {
    use crate::dispatcher::test::{base_registry, run};
    use crate::dispatcher::ProtocolChain;
    use crate::session::test::make_session;
    use crate::session::{HeloInfo, HeloMode};
    use k9::assert_equal;
    use rfc5321::ReversePath;
    use std::sync::Arc;

    fn greet(session: &mut crate::session::Session) {
        session.connection.helo = Some(HeloInfo {
            mode: HeloMode::Ehlo,
            name: "client".to_string(),
        });
    }

    #[tokio::test]
    async fn mail_syntax() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);

        assert_equal!(
            run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await,
            "503 5.5.0 Need HELO or EHLO before MAIL\r\n"
        );
        greet(&mut session);

        for (line, expect) in [
            ("MAIL", "501 5.5.4 Usage: MAIL FROM:<sender>\r\n"),
            ("MAIL FRM:<a@b>", "501 5.5.4 Usage: MAIL FROM:<sender>\r\n"),
            ("MAIL FROM:a@example.com", "501 5.1.7 Syntax error in MAIL command\r\n"),
            ("MAIL FROM:<a@example.com", "501 5.1.7 Syntax error in MAIL command\r\n"),
            (
                "MAIL FROM:<a b@example.com>",
                "501 5.1.7 Syntax error in sender address\r\n",
            ),
            (
                "MAIL FROM:<a@example.com> =bad",
                "501 5.5.4 Syntax error in parameters or arguments\r\n",
            ),
        ] {
            let reply = run(&dispatcher, &mut session, line).await;
            assert!(reply == expect, "{line}: {reply}");
            assert!(session.transaction.sender.is_none());
        }

        assert_equal!(
            run(&dispatcher, &mut session, "MAIL FROM:<>").await,
            "250 2.1.0 Sender <> OK\r\n"
        );
        assert_equal!(session.transaction.sender, Some(ReversePath::NullSender));
    }

    #[tokio::test]
    async fn relaxed_settings() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        let mut settings = (*session.settings).clone();
        settings.helo_ehlo_enforcement = false;
        settings.address_brackets_enforcement = false;
        settings.default_domain = "example.org".to_string();
        session.settings = Arc::new(settings);

        assert_equal!(
            run(&dispatcher, &mut session, "MAIL FROM: user").await,
            "250 2.1.0 Sender <user@example.org> OK\r\n"
        );
    }
}
