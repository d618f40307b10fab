use super::{bad_sequence, unexpected_argument};
use crate::dispatcher::{CapabilityRequirement, CommandOutcome, HookableCommand, NextAction};
use crate::hooks::{
    capability, is_terminal, CapabilityKind, HookRegistry, HookResult, MailEnvelope, MessageHook,
};
use crate::session::{HeloMode, Session};
use rfc5321::{codes, dsn, Response, ReversePath};
use std::sync::Arc;

pub struct DataCmd;

impl HookableCommand for DataCmd {
    type Argument = ();

    fn verbs(&self) -> &'static [&'static str] {
        &["DATA"]
    }

    fn pre_filter(&self, session: &Session, verb: &str, argument: Option<&str>) -> Result<(), Response> {
        if argument.is_some() {
            return Err(unexpected_argument(verb));
        }
        if session.transaction.sender.is_none() {
            return Err(bad_sequence("No sender specified"));
        }
        if session.transaction.recipients.is_empty() {
            return Err(bad_sequence("No recipients specified"));
        }
        Ok(())
    }

    fn core_action(&self, _session: &mut Session, _verb: &str, _: &()) -> CommandOutcome {
        CommandOutcome::with_action(
            Response::plain(codes::DATA_READY, "Ok Send data ending with <CRLF>.<CRLF>"),
            NextAction::ReceiveData,
        )
    }
}

/// Handles the message body once the terminating dot has been read.
/// A message must go somewhere, so at least one `message` hook is
/// required.
#[derive(Default)]
pub struct MessageEnd {
    hooks: Vec<Arc<dyn MessageHook>>,
}

impl MessageEnd {
    pub fn capabilities(&self) -> Vec<CapabilityRequirement> {
        vec![CapabilityRequirement::required(CapabilityKind::Message)]
    }

    pub fn wire(&mut self, registry: &HookRegistry) {
        self.hooks = registry.hooks_for::<capability::Message>();
    }

    pub async fn execute(&self, session: &mut Session, body: &[u8]) -> Response {
        let response = self.process(session, body).await;
        // The transaction ends here, whatever the outcome
        session.reset_transaction();
        response
    }

    async fn process(&self, session: &mut Session, body: &[u8]) -> Response {
        let max_size = session.settings.max_message_size;
        if max_size > 0 && body.len() as u64 > max_size {
            return Response::with_status(
                codes::QUOTA_EXCEEDED,
                dsn::SYSTEM_MSG_TOO_BIG,
                "Error processing message: message size exceeds fixed maximum message size",
            );
        }

        let envelope = MailEnvelope {
            session_id: session.id,
            sender: session
                .transaction
                .sender
                .clone()
                .unwrap_or(ReversePath::NullSender),
            recipients: session.transaction.recipients.clone(),
            data: with_received_header(session, body),
        };
        let core = Response::with_status(codes::MAIL_OK, dsn::CONTENT_OTHER, "Message received");

        for hook in &self.hooks {
            let result: HookResult = hook.on_message(session, &envelope).await;
            if is_terminal(CapabilityKind::Message, &result) {
                return result.to_response(&core, CapabilityKind::Message);
            }
        }
        core
    }
}

fn with_received_header(session: &Session, body: &[u8]) -> Vec<u8> {
    let helo = session
        .connection
        .helo
        .as_ref()
        .map(|h| h.name.as_str())
        .unwrap_or("unknown");
    let protocol = match session.connection.helo.as_ref().map(|h| h.mode) {
        Some(HeloMode::Ehlo) => "ESMTP",
        _ => "SMTP",
    };

    let mut header = format!(
        "Received: from {helo} ({} [{}])\r\n        by {} (smtpd) with {protocol} id {}",
        session.remote_host,
        session.remote_ip(),
        session.hello_name(),
        session.id.simple(),
    );
    if let [recipient] = session.transaction.recipients.as_slice() {
        header.push_str(&format!("\r\n        for <{recipient}>"));
    }
    header.push_str(&format!(";\r\n        {}\r\n", chrono::Local::now().to_rfc2822()));

    let mut data = Vec::with_capacity(header.len() + body.len());
    data.extend_from_slice(header.as_bytes());
    data.extend_from_slice(body);
    data
}

#[cfg(test)]
mod test {
    use crate::dispatcher::test::{base_registry, run};
    use crate::dispatcher::{NextAction, ProtocolChain};
    use crate::hooks::{capability, HookResult, MailEnvelope, MessageHook};
    use crate::session::test::make_session;
    use crate::session::Session;
    use async_trait::async_trait;
    use k9::assert_equal;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Capture {
        messages: Mutex<Vec<MailEnvelope>>,
    }

    #[async_trait]
    impl MessageHook for Capture {
        async fn on_message(&self, _session: &mut Session, message: &MailEnvelope) -> HookResult {
            self.messages.lock().push(message.clone());
            HookResult::declined()
        }
    }

    #[tokio::test]
    async fn data_sequence() {
        let dispatcher = ProtocolChain::smtp().build(&base_registry(), &[]).unwrap();
        let mut session = make_session(false);
        run(&dispatcher, &mut session, "HELO client").await;

        assert_equal!(
            run(&dispatcher, &mut session, "DATA now").await,
            "501 5.5.4 Unexpected argument provided with DATA command\r\n"
        );
        assert_equal!(
            run(&dispatcher, &mut session, "DATA").await,
            "503 5.5.0 No sender specified\r\n"
        );
        run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await;
        assert_equal!(
            run(&dispatcher, &mut session, "DATA").await,
            "503 5.5.0 No recipients specified\r\n"
        );
        run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await;
        let outcome = dispatcher.dispatch(&mut session, "DATA").await;
        assert_equal!(outcome.action, NextAction::ReceiveData);
        assert_equal!(
            outcome.response.to_wire(),
            "354 Ok Send data ending with <CRLF>.<CRLF>\r\n"
        );
    }

    #[tokio::test]
    async fn message_end_delivers_and_resets() {
        let capture = Arc::new(Capture::default());
        let mut registry = base_registry();
        registry.register::<capability::Message>(capture.clone());
        let dispatcher = ProtocolChain::smtp().build(&registry, &[]).unwrap();
        let mut session = make_session(false);

        run(&dispatcher, &mut session, "EHLO client").await;
        run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await;
        run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await;
        let response = dispatcher
            .on_message(&mut session, b"Subject: hi\r\n\r\nhello\r\n")
            .await;
        assert_equal!(response.to_wire(), "250 2.6.0 Message received\r\n");
        assert!(session.transaction.is_empty());

        let messages = capture.messages.lock();
        assert_equal!(messages.len(), 1);
        let text = String::from_utf8_lossy(&messages[0].data).to_string();
        assert!(text.starts_with(
            "Received: from client (client.example.net [192.0.2.1])\r\n        by mx.example.com (smtpd) with ESMTP id "
        ));
        assert!(text.contains("for <b@example.com>;"));
        assert!(text.ends_with("\r\nSubject: hi\r\n\r\nhello\r\n"));
        assert_equal!(messages[0].sender.to_string(), "a@example.com");
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let capture = Arc::new(Capture::default());
        let mut registry = base_registry();
        registry.register::<capability::Message>(capture.clone());
        let dispatcher = ProtocolChain::smtp().build(&registry, &[]).unwrap();
        let mut session = make_session(false);
        let mut settings = (*session.settings).clone();
        settings.max_message_size = 4;
        session.settings = Arc::new(settings);

        run(&dispatcher, &mut session, "HELO client").await;
        run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await;
        run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await;
        let response = dispatcher.on_message(&mut session, b"too large\r\n").await;
        assert_equal!(
            response.to_wire(),
            "552 5.3.4 Error processing message: message size exceeds fixed maximum message size\r\n"
        );
        assert!(session.transaction.is_empty());
        assert!(capture.messages.lock().is_empty());
    }
}
