use crate::hooks::{HookResult, RcptHook};
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::{codes, dsn, ForwardPath};

/// Temporarily rejects recipients beyond a fixed count
pub struct MaxRcpt {
    max: usize,
}

impl MaxRcpt {
    pub fn new(max: usize) -> Self {
        Self { max }
    }
}

#[async_trait]
impl RcptHook for MaxRcpt {
    async fn on_rcpt(&self, session: &mut Session, _recipient: &ForwardPath) -> HookResult {
        // The recipient under consideration has already been recorded
        if session.transaction.recipients.len() > self.max {
            return HookResult::deny_soft().with_reply(
                codes::SYSTEM_STORAGE_ERROR,
                dsn::DELIVERY_TOO_MANY_REC,
                "Requested action not taken: max recipients reached",
            );
        }
        HookResult::declined()
    }
}
