use crate::hooks::{HeloHook, HookResult, RcptHook};
use crate::session::Session;
use async_trait::async_trait;
use dns_resolver::Resolver;
use rfc5321::{codes, dsn, Domain, ForwardPath};
use std::sync::Arc;

/// Transaction attribute holding a greeting name that did not resolve
pub const BAD_EHLO_HELO: &str = "resolvable_helo.bad_name";

/// Checks that the name given in HELO/EHLO resolves.
///
/// The greeting itself is never refused. An unresolvable name is
/// recorded in the transaction, and each subsequent RCPT from an
/// untrusted peer is refused while that marker is present.
pub struct ResolvableHelo {
    resolver: Arc<dyn Resolver>,
    check_authorized_networks: bool,
}

impl ResolvableHelo {
    pub fn new(resolver: Arc<dyn Resolver>, check_authorized_networks: bool) -> Self {
        Self {
            resolver,
            check_authorized_networks,
        }
    }

    fn applies_to(&self, session: &Session) -> bool {
        !session.trusted || self.check_authorized_networks
    }
}

#[async_trait]
impl HeloHook for ResolvableHelo {
    async fn on_helo(&self, session: &mut Session, name: &str) -> HookResult {
        if !self.applies_to(session) {
            return HookResult::declined();
        }
        // Address literals have nothing to resolve
        if Domain::parse(name).map(|d| d.is_address_literal()).unwrap_or(false) {
            return HookResult::declined();
        }
        if let Err(err) = self.resolver.resolve_ip(name).await {
            tracing::debug!(session = %session.id, "greeting name does not resolve: {err:#}");
            session
                .transaction
                .attributes
                .insert(BAD_EHLO_HELO.to_string(), name.into());
        }
        HookResult::declined()
    }
}

#[async_trait]
impl RcptHook for ResolvableHelo {
    async fn on_rcpt(&self, session: &mut Session, _recipient: &ForwardPath) -> HookResult {
        if !self.applies_to(session) {
            return HookResult::declined();
        }
        match session
            .transaction
            .attributes
            .get(BAD_EHLO_HELO)
            .and_then(|v| v.as_str())
        {
            Some(name) => HookResult::deny().with_reply(
                codes::SYNTAX_ERROR_ARGUMENTS,
                dsn::DELIVERY_INVALID_ARG,
                format!("Provided EHLO/HELO {name} can not resolved."),
            ),
            None => HookResult::declined(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dispatcher::test::{base_registry, run};
    use crate::dispatcher::{CommandDispatcher, ProtocolChain};
    use crate::hooks::capability;
    use crate::session::test::make_session;
    use dns_resolver::TestResolver;
    use k9::assert_equal;

    fn dispatcher(check_authorized_networks: bool) -> CommandDispatcher {
        let resolver = TestResolver::new().with_ip("good.example.com", "192.0.2.10".parse().unwrap());
        let hook = Arc::new(ResolvableHelo::new(
            Arc::new(resolver),
            check_authorized_networks,
        ));
        let mut registry = base_registry();
        registry.register::<capability::Helo>(hook.clone());
        registry.register::<capability::Rcpt>(hook);
        ProtocolChain::smtp().build(&registry, &[]).unwrap()
    }

    #[tokio::test]
    async fn deferred_rejection() {
        let dispatcher = dispatcher(false);
        let mut session = make_session(false);

        let reply = run(&dispatcher, &mut session, "EHLO bad.example.com").await;
        assert!(reply.starts_with("250-"), "{reply}");
        assert!(session.transaction.attributes.contains_key(BAD_EHLO_HELO));
        assert_equal!(
            run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await,
            "250 2.1.0 Sender <a@example.com> OK\r\n"
        );
        assert_equal!(
            run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await,
            "501 5.5.4 Provided EHLO/HELO bad.example.com can not resolved.\r\n"
        );

        // Greeting again with a good name clears the marker
        run(&dispatcher, &mut session, "HELO good.example.com").await;
        run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await;
        assert_equal!(
            run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await,
            "250 2.1.5 Recipient <b@example.com> OK\r\n"
        );
    }

    #[tokio::test]
    async fn trusted_and_literals() {
        let dispatcher = dispatcher(false);
        let mut session = make_session(true);
        run(&dispatcher, &mut session, "HELO bad.example.com").await;
        run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await;
        assert_equal!(
            run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await,
            "250 2.1.5 Recipient <b@example.com> OK\r\n"
        );

        let mut session = make_session(false);
        run(&dispatcher, &mut session, "HELO [192.0.2.1]").await;
        assert!(session.transaction.attributes.is_empty());

        let dispatcher = self::dispatcher(true);
        let mut session = make_session(true);
        run(&dispatcher, &mut session, "HELO bad.example.com").await;
        run(&dispatcher, &mut session, "MAIL FROM:<a@example.com>").await;
        let reply = run(&dispatcher, &mut session, "RCPT TO:<b@example.com>").await;
        assert!(reply.starts_with("501 5.5.4"), "{reply}");
    }
}
