use super::bad_sequence;
use super::mail::qualify;
use crate::dispatcher::{CapabilityRequirement, CommandOutcome, HookableCommand};
use crate::hooks::{capability, is_terminal, CapabilityKind, HookRegistry, HookResult, RcptHook};
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::{codes, dsn, ForwardPath, ParseError, PathArgument, Response};
use std::sync::Arc;

#[derive(Default)]
pub struct RcptCmd {
    hooks: Vec<Arc<dyn RcptHook>>,
}

fn usage() -> Response {
    Response::with_status(
        codes::SYNTAX_ERROR_ARGUMENTS,
        dsn::DELIVERY_INVALID_ARG,
        "Usage: RCPT TO:<recipient>",
    )
}

fn syntax_error(message: &str) -> Response {
    Response::with_status(codes::SYNTAX_ERROR_ARGUMENTS, dsn::ADDRESS_SYNTAX, message)
}

#[async_trait]
impl HookableCommand for RcptCmd {
    type Argument = ForwardPath;

    fn verbs(&self) -> &'static [&'static str] {
        &["RCPT"]
    }

    fn capabilities(&self) -> Vec<CapabilityRequirement> {
        vec![CapabilityRequirement::optional(CapabilityKind::Rcpt)]
    }

    fn wire(&mut self, registry: &HookRegistry) {
        self.hooks = registry.hooks_for::<capability::Rcpt>();
    }

    fn pre_filter(
        &self,
        session: &Session,
        _verb: &str,
        argument: Option<&str>,
    ) -> Result<ForwardPath, Response> {
        if session.transaction.sender.is_none() {
            return Err(bad_sequence("Need MAIL before RCPT"));
        }
        let argument = argument.ok_or_else(usage)?;

        let parsed = match PathArgument::parse("TO", argument) {
            Ok(parsed) => parsed,
            Err(ParseError::MissingKeyword(_)) => return Err(usage()),
            Err(_) => return Err(syntax_error("Syntax error in parameters or arguments")),
        };
        if !parsed.bracketed && session.settings.address_brackets_enforcement {
            return Err(syntax_error("Syntax error in parameters or arguments"));
        }
        for param in &parsed.parameters {
            tracing::debug!("ignoring unsupported RCPT parameter {param}");
        }

        let path = if parsed.path.eq_ignore_ascii_case("postmaster") {
            parsed.path
        } else {
            qualify(&parsed.path, &session.settings.default_domain)
        };
        ForwardPath::parse(&path).map_err(|_| syntax_error("Syntax error in recipient address"))
    }

    fn core_action(
        &self,
        session: &mut Session,
        _verb: &str,
        recipient: &ForwardPath,
    ) -> CommandOutcome {
        session.transaction.recipients.push(recipient.clone());
        CommandOutcome::reply(Response::with_status(
            codes::MAIL_OK,
            dsn::ADDRESS_VALID,
            format!("Recipient <{recipient}> OK"),
        ))
    }

    async fn hook_chain(
        &self,
        session: &mut Session,
        recipient: &ForwardPath,
    ) -> Option<(CapabilityKind, HookResult)> {
        for hook in &self.hooks {
            let result = hook.on_rcpt(session, recipient).await;
            if is_terminal(CapabilityKind::Rcpt, &result) {
                return Some((CapabilityKind::Rcpt, result));
            }
        }
        None
    }

    fn post_process(&self, session: &mut Session, _recipient: &ForwardPath, response: &Response) {
        if !response.is_success() {
            session.transaction.recipients.pop();
        }
    }
}
