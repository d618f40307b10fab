use crate::hooks::{HookResult, MailEnvelope, MessageHook};
use crate::session::Session;
use async_trait::async_trait;

/// The default message consumer: logs the envelope and leaves the
/// core reply in place. Storage is left to other `message` hooks.
pub struct LogDelivery;

#[async_trait]
impl MessageHook for LogDelivery {
    async fn on_message(&self, session: &mut Session, message: &MailEnvelope) -> HookResult {
        let recipients: Vec<String> = message.recipients.iter().map(|r| r.to_string()).collect();
        tracing::info!(
            session = %session.id,
            "received message from <{}> for {} ({} bytes)",
            message.sender,
            recipients.join(", "),
            message.data.len()
        );
        HookResult::declined()
    }
}
