use crate::dispatcher::CapabilityRequirement;
use crate::hooks::{capability, is_terminal, CapabilityKind, ConnectHook, HookRegistry};
use crate::session::Session;
use rfc5321::{codes, Response};
use std::sync::Arc;

/// Runs `connect` hooks before the banner is sent
#[derive(Default)]
pub struct ConnectStage {
    hooks: Vec<Arc<dyn ConnectHook>>,
}

impl ConnectStage {
    pub fn capabilities(&self) -> Vec<CapabilityRequirement> {
        vec![CapabilityRequirement::optional(CapabilityKind::Connect)]
    }

    pub fn wire(&mut self, registry: &HookRegistry) {
        self.hooks = registry.hooks_for::<capability::Connect>();
    }

    pub async fn execute(&self, session: &mut Session) -> Response {
        let banner = Response::plain(
            codes::SERVICE_READY,
            format!("{} SMTP Server ready", session.hello_name()),
        );
        for hook in &self.hooks {
            let result = hook.on_connect(session).await;
            if is_terminal(CapabilityKind::Connect, &result) {
                let response = result.to_response(&banner, CapabilityKind::Connect);
                if !response.is_positive() {
                    tracing::debug!(
                        "connection from {} rejected: {}",
                        session.remote_addr,
                        response.to_single_line()
                    );
                }
                return response;
            }
        }
        banner
    }
}

#[cfg(test)]
mod test {
    use crate::dispatcher::test::base_registry;
    use crate::dispatcher::ProtocolChain;
    use crate::hooks::{capability, ConnectHook, HookResult};
    use crate::session::test::make_session;
    use crate::session::Session;
    use async_trait::async_trait;
    use k9::assert_equal;
    use std::sync::Arc;

    struct Blocklist;

    #[async_trait]
    impl ConnectHook for Blocklist {
        async fn on_connect(&self, session: &mut Session) -> HookResult {
            if session.trusted {
                HookResult::declined()
            } else {
                HookResult::deny_soft()
            }
        }
    }

    #[tokio::test]
    async fn connect_hooks() {
        let mut registry = base_registry();
        registry.register::<capability::Connect>(Arc::new(Blocklist));
        let dispatcher = ProtocolChain::smtp().build(&registry, &[]).unwrap();

        let mut session = make_session(true);
        assert_equal!(
            dispatcher.on_connect(&mut session).await.to_wire(),
            "220 mx.example.com SMTP Server ready\r\n"
        );

        let mut session = make_session(false);
        assert_equal!(
            dispatcher.on_connect(&mut session).await.to_wire(),
            "451 4.7.1 Temporary problem. Please try again later\r\n"
        );
    }
}
