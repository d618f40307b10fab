//! An extensible SMTP receiving engine.
//!
//! Each command runs through a fixed pipeline: a structural pre-filter,
//! the command's core action, the chain of registered policy hooks for
//! the command's capability, and a post-processing step that rolls back
//! transaction state when the outcome is not a success. Hooks are
//! registered by capability in a [`hooks::HookRegistry`] and wired to
//! their commands once, at startup, by [`dispatcher::ProtocolChain`].
use crate::config::DaemonConfig;
use crate::dispatcher::{CommandDispatcher, ProtocolChain};
use crate::hooks::{capability, HookRegistry};
use dns_resolver::Resolver;
use std::sync::Arc;

pub mod accounting;
pub mod acceptor;
pub mod commands;
pub mod config;
pub mod diagnostic_logging;
pub mod dispatcher;
pub mod fastfail;
pub mod handler;
pub mod hooks;
pub mod management;
pub mod metrics;
pub mod pool;
pub mod session;
pub mod tls;
pub mod watchdog;

pub use acceptor::{ListenerError, RunningListener, SmtpListener};

/// Register the built-in hooks enabled by the configuration
pub fn build_registry(config: &DaemonConfig, resolver: Arc<dyn Resolver>) -> HookRegistry {
    use crate::fastfail::log_delivery::LogDelivery;
    use crate::fastfail::max_rcpt::MaxRcpt;
    use crate::fastfail::message_size::MessageSizeLimit;
    use crate::fastfail::resolvable_helo::ResolvableHelo;

    let mut registry = HookRegistry::new();
    registry.register::<capability::Message>(Arc::new(LogDelivery));

    if config.smtp.max_message_size > 0 {
        let size = Arc::new(MessageSizeLimit::new(config.smtp.max_message_size));
        registry.register::<capability::Ehlo>(size.clone());
        registry.register::<capability::MailParameters>(size);
    }

    if let Some(helo) = &config.hooks.resolvable_helo {
        let hook = Arc::new(ResolvableHelo::new(
            resolver,
            helo.check_authorized_networks,
        ));
        registry.register::<capability::Helo>(hook.clone());
        registry.register::<capability::Rcpt>(hook);
    }

    if let Some(max) = config.hooks.max_rcpt {
        registry.register::<capability::Rcpt>(Arc::new(MaxRcpt::new(max)));
    }

    registry
}

/// Wire the standard command set to the registry, enforcing the
/// capabilities the configuration lists as required
pub fn build_dispatcher(
    config: &DaemonConfig,
    registry: &HookRegistry,
) -> anyhow::Result<CommandDispatcher> {
    Ok(ProtocolChain::smtp().build(registry, &config.hooks.required)?)
}

/// Build the hooks and dispatcher for `config` and start listening
pub async fn start_listener(
    config: &DaemonConfig,
    resolver: Arc<dyn Resolver>,
) -> anyhow::Result<RunningListener> {
    let registry = build_registry(config, resolver.clone());
    let dispatcher = build_dispatcher(config, &registry)?;
    SmtpListener::new(config.smtp.clone(), dispatcher, resolver)
        .start()
        .await
}
