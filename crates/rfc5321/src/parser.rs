use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command line")]
    EmptyLine,
    #[error("invalid domain {0:?}")]
    InvalidDomain(String),
    #[error("invalid address literal {0:?}")]
    InvalidAddressLiteral(String),
    #[error("invalid local part {0:?}")]
    InvalidLocalPart(String),
    #[error("mailbox {0:?} has no @domain")]
    MissingDomain(String),
    #[error("cannot send to null sender")]
    NullRecipient,
    #[error("invalid source route {0:?}")]
    InvalidSourceRoute(String),
    #[error("invalid ESMTP parameter {0:?}")]
    InvalidParameter(String),
    #[error("must enclose address in <> if you want to use ESMTP parameters")]
    ParametersWithoutBrackets,
    #[error("unbalanced angle brackets in {0:?}")]
    UnbalancedBrackets(String),
    #[error("expected {0}:")]
    MissingKeyword(&'static str),
}

/// A command line split into its verb and the raw argument text.
/// The verb is normalized to upper case; the argument is trimmed
/// and is `None` when nothing but whitespace follows the verb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub verb: String,
    pub argument: Option<String>,
}

impl CommandLine {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        if line.trim().is_empty() {
            return Err(ParseError::EmptyLine);
        }
        let (verb, argument) = match line.split_once(' ') {
            Some((verb, argument)) => {
                let argument = argument.trim();
                (
                    verb,
                    if argument.is_empty() {
                        None
                    } else {
                        Some(argument.to_string())
                    },
                )
            }
            None => (line.trim_end(), None),
        };
        Ok(Self {
            verb: verb.to_ascii_uppercase(),
            argument,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    Path(MailPath),
    NullSender,
}

impl ReversePath {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            Ok(Self::NullSender)
        } else {
            Ok(Self::Path(MailPath::parse(s)?))
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::NullSender)
    }
}

impl std::fmt::Display for ReversePath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::NullSender => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardPath {
    Path(MailPath),
    Postmaster,
}

impl ForwardPath {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s.is_empty() {
            Err(ParseError::NullRecipient)
        } else if s.eq_ignore_ascii_case("postmaster") {
            Ok(Self::Postmaster)
        } else {
            Ok(Self::Path(MailPath::parse(s)?))
        }
    }
}

impl std::fmt::Display for ForwardPath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Path(p) => p.fmt(fmt),
            Self::Postmaster => fmt.write_str("postmaster"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPath {
    pub at_domain_list: Vec<String>,
    pub mailbox: Mailbox,
}

impl MailPath {
    /// Parse the text between the angle brackets of a path,
    /// accepting (and retaining) an optional source route.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let mut at_domain_list = vec![];
        let mut mailbox = s;

        if s.starts_with('@') {
            let (route, remainder) = s
                .split_once(':')
                .ok_or_else(|| ParseError::InvalidSourceRoute(s.to_string()))?;
            for hop in route.split(',') {
                let domain = hop
                    .strip_prefix('@')
                    .ok_or_else(|| ParseError::InvalidSourceRoute(s.to_string()))?;
                Domain::parse(domain)?;
                at_domain_list.push(domain.to_string());
            }
            mailbox = remainder;
        }

        Ok(Self {
            at_domain_list,
            mailbox: Mailbox::parse(mailbox)?,
        })
    }
}

impl std::fmt::Display for MailPath {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        // The source route MUST be accepted, SHOULD NOT be
        // generated, and SHOULD be ignored, so it is not rendered
        self.mailbox.fmt(fmt)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub local_part: String,
    pub domain: Domain,
}

impl Mailbox {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let at = s
            .rfind('@')
            .ok_or_else(|| ParseError::MissingDomain(s.to_string()))?;
        let (local_part, domain) = (&s[..at], &s[at + 1..]);
        if !is_valid_local_part(local_part) {
            return Err(ParseError::InvalidLocalPart(local_part.to_string()));
        }
        Ok(Self {
            local_part: local_part.to_string(),
            domain: Domain::parse(domain)?,
        })
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}@{}", self.local_part, self.domain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Domain {
    Name(String),
    V4(String),
    V6(String),
    Tagged { tag: String, literal: String },
}

impl Domain {
    /// Parse either a domain name or an address literal such as
    /// `[10.0.0.1]`, `[IPv6:::1]` or `[tag:content]`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if let Some(literal) = s.strip_prefix('[') {
            let literal = literal
                .strip_suffix(']')
                .ok_or_else(|| ParseError::InvalidAddressLiteral(s.to_string()))?;
            return Self::parse_address_literal(literal)
                .ok_or_else(|| ParseError::InvalidAddressLiteral(s.to_string()));
        }
        if is_valid_domain(s) {
            Ok(Self::Name(s.to_string()))
        } else {
            Err(ParseError::InvalidDomain(s.to_string()))
        }
    }

    fn parse_address_literal(literal: &str) -> Option<Self> {
        if literal.len() > 5 && literal[..5].eq_ignore_ascii_case("IPv6:") {
            let addr = &literal[5..];
            addr.parse::<Ipv6Addr>().ok()?;
            return Some(Self::V6(addr.to_string()));
        }
        if literal.parse::<Ipv4Addr>().is_ok() {
            return Some(Self::V4(literal.to_string()));
        }
        let (tag, content) = literal.split_once(':')?;
        let content_ok = !content.is_empty()
            && content
                .bytes()
                .all(|c| matches!(c, 33..=90 | 94..=126));
        if is_ldh_str(tag) && content_ok {
            Some(Self::Tagged {
                tag: tag.to_string(),
                literal: content.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_address_literal(&self) -> bool {
        !matches!(self, Self::Name(_))
    }
}

impl std::fmt::Display for Domain {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Name(name) => fmt.write_str(name),
            Self::V4(addr) => write!(fmt, "[{addr}]"),
            Self::V6(addr) => write!(fmt, "[IPv6:{addr}]"),
            Self::Tagged { tag, literal } => write!(fmt, "[{tag}:{literal}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EsmtpParameter {
    pub name: String,
    pub value: Option<String>,
}

impl EsmtpParameter {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let (name, value) = match s.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (s, None),
        };
        let name_ok = name
            .bytes()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
            && name.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-');
        let value_ok = value
            .map(|v| !v.is_empty() && v.bytes().all(|c| matches!(c, 33..=60 | 62..=126)))
            .unwrap_or(true);
        if !name_ok || !value_ok {
            return Err(ParseError::InvalidParameter(s.to_string()));
        }
        Ok(Self {
            name: name.to_string(),
            value: value.map(|v| v.to_string()),
        })
    }
}

impl std::fmt::Display for EsmtpParameter {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.value {
            Some(value) => write!(fmt, "{}={}", self.name, value),
            None => fmt.write_str(&self.name),
        }
    }
}

/// The argument of `MAIL FROM:` or `RCPT TO:` split into the
/// path text and its trailing ESMTP parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathArgument {
    /// The path with any enclosing angle brackets removed
    pub path: String,
    /// Whether the path was enclosed in angle brackets
    pub bracketed: bool,
    pub parameters: Vec<EsmtpParameter>,
}

impl PathArgument {
    /// `keyword` is `FROM` or `TO`; it is matched case-insensitively
    /// and may be separated from the colon by whitespace.
    pub fn parse(keyword: &'static str, argument: &str) -> Result<Self, ParseError> {
        let (key, remainder) = argument
            .split_once(':')
            .ok_or(ParseError::MissingKeyword(keyword))?;
        if !key.trim().eq_ignore_ascii_case(keyword) {
            return Err(ParseError::MissingKeyword(keyword));
        }
        let remainder = remainder.trim();

        if let Some(inner) = remainder.strip_prefix('<') {
            let rangle = inner
                .find('>')
                .ok_or_else(|| ParseError::UnbalancedBrackets(remainder.to_string()))?;
            let path = inner[..rangle].to_string();
            let rest = &inner[rangle + 1..];
            if !rest.is_empty() && !rest.starts_with(' ') {
                return Err(ParseError::InvalidParameter(rest.to_string()));
            }
            let parameters = rest
                .split_ascii_whitespace()
                .map(EsmtpParameter::parse)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Self {
                path,
                bracketed: true,
                parameters,
            });
        }

        let mut fields = remainder.split_ascii_whitespace();
        let path = fields.next().unwrap_or("").to_string();
        if path.contains(['<', '>']) {
            return Err(ParseError::UnbalancedBrackets(remainder.to_string()));
        }
        if fields.next().is_some() {
            return Err(ParseError::ParametersWithoutBrackets);
        }
        Ok(Self {
            path,
            bracketed: false,
            parameters: vec![],
        })
    }
}

fn is_atext(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"!#$%&'*+-/=?^_`{|}~".contains(&c)
}

fn is_valid_local_part(s: &str) -> bool {
    if let Some(quoted) = s.strip_prefix('"') {
        let Some(quoted) = quoted.strip_suffix('"') else {
            return false;
        };
        let mut bytes = quoted.bytes();
        while let Some(c) = bytes.next() {
            match c {
                b'\\' => match bytes.next() {
                    Some(32..=126) => {}
                    _ => return false,
                },
                b'"' => return false,
                32..=126 => {}
                _ => return false,
            }
        }
        return true;
    }
    !s.is_empty() && s.split('.').all(|atom| !atom.is_empty() && atom.bytes().all(is_atext))
}

fn is_ldh_str(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().next().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false)
        && s.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-')
}

pub fn is_valid_domain(text: &str) -> bool {
    !text.is_empty() && text.len() <= 255 && text.split('.').all(is_ldh_str)
}
