//! Routes command lines to their handlers.
//!
//! Every command is a `HookableCommand`: a pre-filter that validates
//! the argument against the session, a core action, an optional hook
//! chain and a post-processing step. `Hookable` runs those steps in
//! order. `ProtocolChain` assembles the handlers in two phases: it
//! first collects them along with the capabilities they declare, then
//! resolves those capabilities against a `HookRegistry` and produces
//! a `CommandDispatcher`.
use crate::commands::connect::ConnectStage;
use crate::commands::data::MessageEnd;
use crate::commands::unsupported::UnknownCmd;
use crate::hooks::{CapabilityKind, HookRegistry, HookResult};
use crate::metrics::COMMANDS;
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::{codes, dsn, CommandLine, Response};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    Continue,
    /// Close the connection after sending the reply
    Disconnect,
    /// Read the message body after sending the reply
    ReceiveData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub response: Response,
    pub action: NextAction,
}

impl CommandOutcome {
    pub fn reply(response: Response) -> Self {
        Self {
            response,
            action: NextAction::Continue,
        }
    }

    pub fn with_action(response: Response, action: NextAction) -> Self {
        Self { response, action }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRequirement {
    pub kind: CapabilityKind,
    /// Startup fails unless at least one hook is registered
    pub required: bool,
}

impl CapabilityRequirement {
    pub fn optional(kind: CapabilityKind) -> Self {
        Self {
            kind,
            required: false,
        }
    }

    pub fn required(kind: CapabilityKind) -> Self {
        Self {
            kind,
            required: true,
        }
    }
}

#[async_trait]
pub trait HookableCommand: Send + Sync + 'static {
    /// The validated, typed form of the command argument
    type Argument: Send + Sync;

    fn verbs(&self) -> &'static [&'static str];

    fn capabilities(&self) -> Vec<CapabilityRequirement> {
        vec![]
    }

    /// Receive the hooks for the declared capabilities
    fn wire(&mut self, _registry: &HookRegistry) {}

    /// Structural and sequencing checks. An error response here is
    /// sent as-is: neither the core action nor any hook runs.
    fn pre_filter(
        &self,
        session: &Session,
        verb: &str,
        argument: Option<&str>,
    ) -> Result<Self::Argument, Response>;

    fn core_action(
        &self,
        session: &mut Session,
        verb: &str,
        argument: &Self::Argument,
    ) -> CommandOutcome;

    /// Run hooks in registration order, returning the first result
    /// that is not DECLINED along with the capability it came from.
    async fn hook_chain(
        &self,
        _session: &mut Session,
        _argument: &Self::Argument,
    ) -> Option<(CapabilityKind, HookResult)> {
        None
    }

    /// Side effects that depend on the final reply, such as rolling
    /// back state recorded by the core action.
    fn post_process(&self, _session: &mut Session, _argument: &Self::Argument, _response: &Response) {
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn verbs(&self) -> &'static [&'static str];

    async fn on_command(
        &self,
        session: &mut Session,
        verb: &str,
        argument: Option<&str>,
    ) -> CommandOutcome;
}

/// Drives a `HookableCommand` through its four steps
pub struct Hookable<C> {
    inner: C,
}

impl<C: HookableCommand> Hookable<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<C: HookableCommand> CommandHandler for Hookable<C> {
    fn verbs(&self) -> &'static [&'static str] {
        self.inner.verbs()
    }

    async fn on_command(
        &self,
        session: &mut Session,
        verb: &str,
        argument: Option<&str>,
    ) -> CommandOutcome {
        let parsed = match self.inner.pre_filter(session, verb, argument) {
            Ok(parsed) => parsed,
            Err(response) => return CommandOutcome::reply(response),
        };

        let mut outcome = self.inner.core_action(session, verb, &parsed);

        // Hooks refine a positive outcome; they are not consulted once
        // the core action has already refused the command.
        if outcome.response.is_positive() {
            if let Some((kind, result)) = self.inner.hook_chain(session, &parsed).await {
                outcome.response = result.to_response(&outcome.response, kind);
                if !outcome.response.is_positive() {
                    outcome.action = NextAction::Continue;
                    tracing::debug!(
                        "{verb} rejected by {kind} hook: {}",
                        outcome.response.to_single_line()
                    );
                }
            }
        }

        self.inner.post_process(session, &parsed, &outcome.response);
        outcome
    }
}

trait PendingHandler: Send {
    fn verbs(&self) -> &'static [&'static str];
    fn capabilities(&self) -> Vec<CapabilityRequirement>;
    fn wire(self: Box<Self>, registry: &HookRegistry) -> Arc<dyn CommandHandler>;
}

impl<C: HookableCommand> PendingHandler for C {
    fn verbs(&self) -> &'static [&'static str] {
        HookableCommand::verbs(self)
    }

    fn capabilities(&self) -> Vec<CapabilityRequirement> {
        HookableCommand::capabilities(self)
    }

    fn wire(mut self: Box<Self>, registry: &HookRegistry) -> Arc<dyn CommandHandler> {
        HookableCommand::wire(&mut *self, registry);
        Arc::new(Hookable::new(*self))
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChainError {
    #[error("verb {0} is handled by more than one command handler")]
    DuplicateVerb(String),
    #[error("{handler} requires at least one {capability} hook, but none are registered")]
    MissingCapability {
        handler: String,
        capability: CapabilityKind,
    },
}

/// Collects command handlers prior to wiring them to hooks
pub struct ProtocolChain {
    pending: Vec<Box<dyn PendingHandler>>,
    connect: ConnectStage,
    message: MessageEnd,
}

impl Default for ProtocolChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolChain {
    /// An empty chain; only the connect and end-of-message stages
    pub fn new() -> Self {
        Self {
            pending: vec![],
            connect: ConnectStage::default(),
            message: MessageEnd::default(),
        }
    }

    /// The standard SMTP command set
    pub fn smtp() -> Self {
        use crate::commands::*;
        Self::new()
            .with(helo::HeloCmd::default())
            .with(mail::MailCmd::default())
            .with(rcpt::RcptCmd::default())
            .with(data::DataCmd)
            .with(rset::RsetCmd)
            .with(noop::NoopCmd)
            .with(quit::QuitCmd)
            .with(unsupported::UnsupportedCmd)
    }

    pub fn with<C: HookableCommand>(mut self, command: C) -> Self {
        self.pending.push(Box::new(command));
        self
    }

    /// Resolve capabilities against the registry and build the
    /// dispatcher. `also_required` names capabilities that must have
    /// hooks regardless of what the handlers declare.
    pub fn build(
        self,
        registry: &HookRegistry,
        also_required: &[CapabilityKind],
    ) -> Result<CommandDispatcher, ChainError> {
        let mut requirements: Vec<(String, CapabilityRequirement)> = vec![];
        for pending in &self.pending {
            let name = pending.verbs().join("/");
            for req in pending.capabilities() {
                requirements.push((name.clone(), req));
            }
        }
        for req in self.connect.capabilities() {
            requirements.push(("connect".to_string(), req));
        }
        for req in self.message.capabilities() {
            requirements.push(("end of message".to_string(), req));
        }
        for &kind in also_required {
            requirements.push((
                "configuration".to_string(),
                CapabilityRequirement::required(kind),
            ));
        }

        for (handler, req) in &requirements {
            if req.required && registry.count(req.kind) == 0 {
                return Err(ChainError::MissingCapability {
                    handler: handler.clone(),
                    capability: req.kind,
                });
            }
        }

        let mut handlers: HashMap<&'static str, Arc<dyn CommandHandler>> = HashMap::new();
        for pending in self.pending {
            let verbs = pending.verbs();
            for verb in verbs {
                if handlers.contains_key(verb) {
                    return Err(ChainError::DuplicateVerb(verb.to_string()));
                }
            }
            let handler = pending.wire(registry);
            for verb in verbs {
                handlers.insert(verb, handler.clone());
            }
        }

        let mut connect = self.connect;
        connect.wire(registry);
        let mut message = self.message;
        message.wire(registry);

        Ok(CommandDispatcher {
            handlers,
            unknown: Arc::new(Hookable::new(UnknownCmd)),
            connect,
            message,
        })
    }
}

/// Maps verbs to handlers. One handler per verb.
pub struct CommandDispatcher {
    handlers: HashMap<&'static str, Arc<dyn CommandHandler>>,
    unknown: Arc<dyn CommandHandler>,
    connect: ConnectStage,
    message: MessageEnd,
}

impl CommandDispatcher {
    pub async fn dispatch(&self, session: &mut Session, line: &str) -> CommandOutcome {
        let command = match CommandLine::parse(line) {
            Ok(command) => command,
            Err(_) => {
                return CommandOutcome::reply(Response::with_status(
                    codes::SYNTAX_ERROR_COMMAND_UNRECOGNIZED,
                    dsn::DELIVERY_SYNTAX,
                    "Syntax error, command unrecognized",
                ))
            }
        };

        let handler = match self.handlers.get(command.verb.as_str()) {
            Some(handler) => {
                COMMANDS.with_label_values(&[command.verb.as_str()]).inc();
                handler
            }
            None => {
                COMMANDS.with_label_values(&["unknown"]).inc();
                &self.unknown
            }
        };

        handler
            .on_command(session, &command.verb, command.argument.as_deref())
            .await
    }

    /// Runs as the connection is established. A non-positive reply
    /// means the connection is to be closed after sending it.
    pub async fn on_connect(&self, session: &mut Session) -> Response {
        self.connect.execute(session).await
    }

    /// Runs once the body following DATA has been read
    pub async fn on_message(&self, session: &mut Session, body: &[u8]) -> Response {
        self.message.execute(session, body).await
    }

    pub fn verbs(&self) -> Vec<&'static str> {
        let mut verbs: Vec<_> = self.handlers.keys().copied().collect();
        verbs.sort();
        verbs
    }
}
