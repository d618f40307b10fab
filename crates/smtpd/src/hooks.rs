//! Policy hooks and the registry that holds them.
//!
//! A hook implements one or more capability traits. Hooks are
//! registered once at startup, keyed by capability, and handed to
//! the command handlers that consult them in registration order.
//! Hooks never produce wire syntax; they return a `HookResult` which
//! the dispatcher maps to exactly one reply.
use crate::metrics::HOOK_VERDICTS;
use crate::session::Session;
use async_trait::async_trait;
use rfc5321::dsn::{self, SubjectDetail};
use rfc5321::{codes, ForwardPath, Response, ReversePath, StatusClass};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HookReturnCode {
    /// No opinion; continue with the next hook
    Declined,
    /// Accept and stop the chain
    Ok,
    /// Permanent rejection
    Deny,
    /// Temporary rejection
    DenySoft,
}

impl HookReturnCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Declined => "declined",
            Self::Ok => "ok",
            Self::Deny => "deny",
            Self::DenySoft => "deny_soft",
        }
    }

    fn expected_class(&self) -> StatusClass {
        match self {
            Self::Declined | Self::Ok => StatusClass::Success,
            Self::Deny => StatusClass::Permanent,
            Self::DenySoft => StatusClass::Transient,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookResult {
    pub code: HookReturnCode,
    pub reply_code: Option<u16>,
    pub enhanced: Option<SubjectDetail>,
    pub message: Option<String>,
}

impl HookResult {
    fn new(code: HookReturnCode) -> Self {
        Self {
            code,
            reply_code: None,
            enhanced: None,
            message: None,
        }
    }

    pub fn declined() -> Self {
        Self::new(HookReturnCode::Declined)
    }

    pub fn ok() -> Self {
        Self::new(HookReturnCode::Ok)
    }

    pub fn deny() -> Self {
        Self::new(HookReturnCode::Deny)
    }

    pub fn deny_soft() -> Self {
        Self::new(HookReturnCode::DenySoft)
    }

    /// Supply the reply code, enhanced status subject and text to use
    /// in place of the defaults for this verdict.
    pub fn with_reply(
        mut self,
        reply_code: u16,
        enhanced: SubjectDetail,
        message: impl Into<String>,
    ) -> Self {
        self.reply_code = Some(reply_code);
        self.enhanced = Some(enhanced);
        self.message = Some(message.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_declined(&self) -> bool {
        self.code == HookReturnCode::Declined
    }

    /// Map this verdict to the reply that goes on the wire.
    /// `core` is the response produced by the command's core action.
    pub fn to_response(&self, core: &Response, capability: CapabilityKind) -> Response {
        let (default_code, default_enhanced, default_text) = match self.code {
            HookReturnCode::Declined => return core.clone(),
            HookReturnCode::Ok => {
                if self.reply_code.is_none() && self.message.is_none() {
                    return core.clone();
                }
                (codes::MAIL_OK, dsn::UNDEFINED_STATUS, core.content.as_str())
            }
            HookReturnCode::Deny => (
                codes::TRANSACTION_FAILED,
                dsn::SECURITY_AUTH,
                "Email rejected",
            ),
            HookReturnCode::DenySoft => (
                codes::LOCAL_ERROR,
                dsn::SECURITY_AUTH,
                "Temporary problem. Please try again later",
            ),
        };

        let (reply_code, enhanced) = match self.reply_code {
            Some(code) if StatusClass::from_code(code) == Some(self.code.expected_class()) => {
                (code, self.enhanced.unwrap_or(dsn::UNDEFINED_STATUS))
            }
            Some(code) => {
                tracing::warn!(
                    "{} hook returned {} with reply code {code}, \
                     which contradicts the verdict; using {default_code}",
                    capability.name(),
                    self.code.as_str()
                );
                (default_code, default_enhanced)
            }
            None => (default_code, self.enhanced.unwrap_or(default_enhanced)),
        };

        let text = self.message.as_deref().unwrap_or(default_text);
        Response::with_status(reply_code, enhanced, text)
    }
}

/// Count a hook result and report whether it ends the chain
pub fn is_terminal(capability: CapabilityKind, result: &HookResult) -> bool {
    HOOK_VERDICTS
        .with_label_values(&[capability.name(), result.code.as_str()])
        .inc();
    !result.is_declined()
}

/// Identifies a capability contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    Connect,
    Helo,
    EhloExtension,
    Mail,
    MailParameters,
    Rcpt,
    Message,
}

impl CapabilityKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::EhloExtension => "ehlo_extension",
            Self::Mail => "mail",
            Self::MailParameters => "mail_parameters",
            Self::Rcpt => "rcpt",
            Self::Message => "message",
        }
    }
}

impl std::fmt::Display for CapabilityKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(self.name())
    }
}

/// A message as handed to `message` hooks once DATA completes
#[derive(Debug, Clone)]
pub struct MailEnvelope {
    pub session_id: Uuid,
    pub sender: ReversePath,
    pub recipients: Vec<ForwardPath>,
    /// The message including the prepended Received header
    pub data: Vec<u8>,
}

#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn on_connect(&self, session: &mut Session) -> HookResult;
}

#[async_trait]
pub trait HeloHook: Send + Sync {
    async fn on_helo(&self, session: &mut Session, name: &str) -> HookResult;
}

/// Contributes lines to the EHLO reply
pub trait EhloExtension: Send + Sync {
    fn extensions(&self, session: &Session) -> Vec<String>;
}

#[async_trait]
pub trait MailHook: Send + Sync {
    async fn on_mail(&self, session: &mut Session, sender: &ReversePath) -> HookResult;
}

#[async_trait]
pub trait MailParametersHook: Send + Sync {
    /// The ESMTP parameter names handled by this hook
    fn param_names(&self) -> &[&'static str];

    async fn on_parameter(
        &self,
        session: &mut Session,
        name: &str,
        value: Option<&str>,
    ) -> HookResult;
}

#[async_trait]
pub trait RcptHook: Send + Sync {
    async fn on_rcpt(&self, session: &mut Session, recipient: &ForwardPath) -> HookResult;
}

#[async_trait]
pub trait MessageHook: Send + Sync {
    async fn on_message(&self, session: &mut Session, message: &MailEnvelope) -> HookResult;
}

/// Associates a capability marker with its hook trait
pub trait Capability: 'static {
    type Hook: ?Sized + Send + Sync + 'static;
    const KIND: CapabilityKind;
}

pub mod capability {
    use super::*;

    macro_rules! capability {
        ($name:ident, $hook:ident, $kind:ident) => {
            pub struct $name;
            impl Capability for $name {
                type Hook = dyn $hook;
                const KIND: CapabilityKind = CapabilityKind::$kind;
            }
        };
    }

    capability!(Connect, ConnectHook, Connect);
    capability!(Helo, HeloHook, Helo);
    capability!(Ehlo, EhloExtension, EhloExtension);
    capability!(Mail, MailHook, Mail);
    capability!(MailParameters, MailParametersHook, MailParameters);
    capability!(Rcpt, RcptHook, Rcpt);
    capability!(Message, MessageHook, Message);
}

/// Maps capability kinds to their ordered hooks.
/// Populated once at startup and treated as read-only afterwards.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<CapabilityKind, Box<dyn Any + Send + Sync>>,
    counts: HashMap<CapabilityKind, usize>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<C: Capability>(&mut self, hook: Arc<C::Hook>) {
        let entry = self
            .hooks
            .entry(C::KIND)
            .or_insert_with(|| Box::new(Vec::<Arc<C::Hook>>::new()));
        if let Some(list) = entry.downcast_mut::<Vec<Arc<C::Hook>>>() {
            list.push(hook);
            *self.counts.entry(C::KIND).or_default() += 1;
        }
        tracing::debug!("registered {} hook", C::KIND);
    }

    /// The hooks for a capability, in registration order
    pub fn hooks_for<C: Capability>(&self) -> Vec<Arc<C::Hook>> {
        self.hooks
            .get(&C::KIND)
            .and_then(|entry| entry.downcast_ref::<Vec<Arc<C::Hook>>>())
            .cloned()
            .unwrap_or_default()
    }

    pub fn count(&self, kind: CapabilityKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }
}
