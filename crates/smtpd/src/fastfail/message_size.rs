use crate::hooks::{EhloExtension, HookResult, MailParametersHook};
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::{codes, dsn};

/// Advertises SIZE and rejects MAIL commands that declare a larger
/// message than we accept
pub struct MessageSizeLimit {
    max: u64,
}

impl MessageSizeLimit {
    pub fn new(max: u64) -> Self {
        Self { max }
    }
}

impl EhloExtension for MessageSizeLimit {
    fn extensions(&self, _session: &Session) -> Vec<String> {
        vec![format!("SIZE {}", self.max)]
    }
}

#[async_trait]
impl MailParametersHook for MessageSizeLimit {
    fn param_names(&self) -> &[&'static str] {
        &["SIZE"]
    }

    async fn on_parameter(
        &self,
        session: &mut Session,
        _name: &str,
        value: Option<&str>,
    ) -> HookResult {
        let size = match value.and_then(|v| v.parse::<u64>().ok()) {
            Some(size) => size,
            None => {
                return HookResult::deny().with_reply(
                    codes::SYNTAX_ERROR_ARGUMENTS,
                    dsn::DELIVERY_INVALID_ARG,
                    "Syntactically incorrect value for SIZE parameter",
                )
            }
        };
        if size > self.max {
            tracing::debug!(
                session = %session.id,
                "rejecting declared size {size}, limit is {}",
                self.max
            );
            return HookResult::deny().with_reply(
                codes::QUOTA_EXCEEDED,
                dsn::SYSTEM_MSG_TOO_BIG,
                "Message size exceeds fixed maximum message size",
            );
        }
        session.transaction.declared_size = Some(size);
        HookResult::declined()
    }
}
