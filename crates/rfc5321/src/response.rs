use serde::{Deserialize, Serialize};

/// Reply codes from RFC 5321 section 4.2.3
pub mod codes {
    pub const SERVICE_READY: u16 = 220;
    pub const SYSTEM_QUIT: u16 = 221;
    pub const MAIL_OK: u16 = 250;
    pub const MAIL_UNDEFINDED: u16 = 252;
    pub const DATA_READY: u16 = 354;
    pub const SERVICE_NOT_AVAILABLE: u16 = 421;
    pub const LOCAL_ERROR: u16 = 451;
    pub const SYSTEM_STORAGE_ERROR: u16 = 452;
    pub const SYNTAX_ERROR_COMMAND_UNRECOGNIZED: u16 = 500;
    pub const SYNTAX_ERROR_ARGUMENTS: u16 = 501;
    pub const UNIMPLEMENTED_COMMAND: u16 = 502;
    pub const BAD_SEQUENCE: u16 = 503;
    pub const QUOTA_EXCEEDED: u16 = 552;
    pub const TRANSACTION_FAILED: u16 = 554;
}

/// Subject and detail pairs from RFC 3463, combined with a
/// [StatusClass] to form an [EnhancedStatusCode].
pub mod dsn {
    pub type SubjectDetail = (u16, u16);

    pub const UNDEFINED_STATUS: SubjectDetail = (0, 0);
    pub const ADDRESS_OTHER: SubjectDetail = (1, 0);
    pub const ADDRESS_SYNTAX: SubjectDetail = (1, 3);
    pub const ADDRESS_VALID: SubjectDetail = (1, 5);
    pub const ADDRESS_SYNTAX_SENDER: SubjectDetail = (1, 7);
    pub const SYSTEM_OTHER: SubjectDetail = (3, 0);
    pub const SYSTEM_NOT_ACCEPTING: SubjectDetail = (3, 2);
    pub const SYSTEM_NOT_CAPABLE: SubjectDetail = (3, 3);
    pub const SYSTEM_MSG_TOO_BIG: SubjectDetail = (3, 4);
    pub const DELIVERY_OTHER: SubjectDetail = (5, 0);
    pub const DELIVERY_INVALID_CMD: SubjectDetail = (5, 1);
    pub const DELIVERY_SYNTAX: SubjectDetail = (5, 2);
    pub const DELIVERY_TOO_MANY_REC: SubjectDetail = (5, 3);
    pub const DELIVERY_INVALID_ARG: SubjectDetail = (5, 4);
    pub const CONTENT_OTHER: SubjectDetail = (6, 0);
    pub const SECURITY_OTHER: SubjectDetail = (7, 0);
    pub const SECURITY_AUTH: SubjectDetail = (7, 1);
}

/// The three classes of completion that a reply can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusClass {
    Success,
    Transient,
    Permanent,
}

impl StatusClass {
    /// Derive the class from a three digit reply code.
    /// Intermediate (3xx) and out of range codes have no class.
    pub fn from_code(code: u16) -> Option<Self> {
        match code / 100 {
            2 => Some(Self::Success),
            4 => Some(Self::Transient),
            5 => Some(Self::Permanent),
            _ => None,
        }
    }

    pub fn digit(self) -> u8 {
        match self {
            Self::Success => 2,
            Self::Transient => 4,
            Self::Permanent => 5,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy, Hash)]
pub struct EnhancedStatusCode {
    pub class: u8,
    pub subject: u16,
    pub detail: u16,
}

impl EnhancedStatusCode {
    pub fn new(class: StatusClass, (subject, detail): dsn::SubjectDetail) -> Self {
        Self {
            class: class.digit(),
            subject,
            detail,
        }
    }
}

impl std::fmt::Display for EnhancedStatusCode {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// A complete reply: a reply code, an optional enhanced status code,
/// and free text. Text containing newlines is sent as a multi-line
/// reply, with the enhanced code repeated on every line.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Hash)]
pub struct Response {
    pub code: u16,
    pub enhanced_code: Option<EnhancedStatusCode>,
    pub content: String,
}

impl Response {
    pub fn new<S: Into<String>>(
        code: u16,
        enhanced_code: Option<EnhancedStatusCode>,
        content: S,
    ) -> Self {
        Self {
            code,
            enhanced_code,
            content: content.into(),
        }
    }

    /// Build a reply whose enhanced status class is derived from `code`,
    /// so that the two can never disagree.
    pub fn with_status<S: Into<String>>(
        code: u16,
        subject_detail: dsn::SubjectDetail,
        content: S,
    ) -> Self {
        let enhanced_code =
            StatusClass::from_code(code).map(|class| EnhancedStatusCode::new(class, subject_detail));
        Self::new(code, enhanced_code, content)
    }

    /// A reply without an enhanced status code, such as the
    /// banner or the 354 intermediate reply.
    pub fn plain<S: Into<String>>(code: u16, content: S) -> Self {
        Self::new(code, None, content)
    }

    pub fn class(&self) -> Option<StatusClass> {
        StatusClass::from_code(self.code)
    }

    /// true for 2xx and 3xx replies
    pub fn is_positive(&self) -> bool {
        self.code < 400
    }

    pub fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 300
    }

    pub fn is_transient(&self) -> bool {
        self.code >= 400 && self.code < 500
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500 && self.code < 600
    }

    /// Append a line to the reply, turning it into a multi-line reply
    pub fn push_line<S: AsRef<str>>(&mut self, line: S) {
        if !self.content.is_empty() {
            self.content.push('\n');
        }
        self.content.push_str(line.as_ref());
    }

    /// Encode for transmission. Every line but the last uses the
    /// `code-text` continuation form.
    pub fn to_wire(&self) -> String {
        let mut result = String::new();
        let mut lines = self.content.lines().peekable();
        if lines.peek().is_none() {
            result.push_str(&self.format_line("", true));
        }
        while let Some(line) = lines.next() {
            let is_last = lines.peek().is_none();
            result.push_str(&self.format_line(line, is_last));
        }
        result
    }

    fn format_line(&self, line: &str, is_last: bool) -> String {
        let sep = if is_last { ' ' } else { '-' };
        match &self.enhanced_code {
            Some(enh) => format!("{}{sep}{enh} {line}\r\n", self.code),
            None => format!("{}{sep}{line}\r\n", self.code),
        }
    }

    pub fn to_single_line(&self) -> String {
        let mut line = format!("{} ", self.code);

        if let Some(enh) = &self.enhanced_code {
            line.push_str(&format!("{enh} "));
        }

        line.push_str(&remove_line_break(&self.content));

        line
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.write_str(&self.to_single_line())
    }
}

fn parse_enhanced_status_code(line: &str) -> Option<(EnhancedStatusCode, &str)> {
    let mut fields = line.splitn(3, '.');
    let class = fields.next()?.parse::<u8>().ok()?;
    if !matches!(class, 2 | 4 | 5) {
        // No other classes are defined
        return None;
    }
    let subject = fields.next()?.parse::<u16>().ok()?;

    let remainder = fields.next()?;
    let mut fields = remainder.splitn(2, ' ');
    let detail = fields.next()?.parse::<u16>().ok()?;
    let remainder = fields.next().unwrap_or("");

    Some((
        EnhancedStatusCode {
            class,
            subject,
            detail,
        },
        remainder,
    ))
}

fn remove_line_break(data: &str) -> String {
    data.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

/// One line of a reply as read from the wire
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

impl<'a> ResponseLine<'a> {
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 3 || !line.is_char_boundary(3) {
            return None;
        }
        let code = line[0..3].parse::<u16>().ok()?;
        let (is_final, content) = match line.as_bytes().get(3) {
            None => (true, ""),
            Some(b' ') => (true, &line[4..]),
            Some(b'-') => (false, &line[4..]),
            Some(_) => return None,
        };
        Some(Self {
            code,
            is_final,
            content,
        })
    }

    /// Reconstitute the original line that we parsed
    fn to_original_line(&self) -> String {
        format!(
            "{}{}{}",
            self.code,
            if self.is_final { " " } else { "-" },
            self.content
        )
    }
}

/// Accumulates the lines of a multi-line reply back into a [Response]
pub struct ResponseBuilder {
    code: u16,
    enhanced_code: Option<EnhancedStatusCode>,
    content: String,
}

impl ResponseBuilder {
    pub fn new(parsed: &ResponseLine) -> Self {
        let code = parsed.code;
        let (enhanced_code, content) = match parse_enhanced_status_code(parsed.content) {
            Some((enhanced, content)) => (Some(enhanced), content.to_string()),
            None => (None, parsed.content.to_string()),
        };

        Self {
            code,
            enhanced_code,
            content,
        }
    }

    pub fn add_line(&mut self, parsed: &ResponseLine) -> Result<(), String> {
        if parsed.code != self.code {
            return Err(parsed.to_original_line());
        }

        self.content.push('\n');

        let mut content = parsed.content;

        if let Some(enh) = &self.enhanced_code {
            let prefix = format!("{enh} ");
            if let Some(remainder) = parsed.content.strip_prefix(&prefix) {
                content = remainder;
            }
        }

        self.content.push_str(content);
        Ok(())
    }

    pub fn build(self) -> Response {
        Response {
            code: self.code,
            content: self.content,
            enhanced_code: self.enhanced_code,
        }
    }
}
