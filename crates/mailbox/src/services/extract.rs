use crate::models::message::{Envelope, NewMessage};
use crate::services::error::ExtractError;
use mail_parser::{HeaderName, Message as ParsedMail, MessageParser, MessagePart, MimeHeaders, PartType};
use tracing::warn;

/// Plain body used whenever nothing readable can be pulled out of a message.
pub const BODY_ERROR: &str = "Error reading email body";

/// Wrap width for text derived from HTML.
const HTML_TEXT_WIDTH: usize = 80;

/// Displayable bodies of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub plain: String,
    pub html: Option<String>,
}

impl Content {
    fn unreadable() -> Self {
        Content {
            plain: BODY_ERROR.to_string(),
            html: None,
        }
    }
}

/// Decodes raw message bytes into a plain body and an optional HTML body.
/// Never fails: malformed input yields [`BODY_ERROR`].
pub fn extract_content(raw: &[u8]) -> Content {
    match MessageParser::default().parse(raw) {
        Some(message) => content_or_error(&message),
        None => {
            warn!("Failed to read email body: {}", ExtractError::Unparseable);
            Content::unreadable()
        }
    }
}

/// Parses a complete message (headers and bodies) ready for the store.
pub fn parse_message(raw: &[u8], envelope: Envelope) -> NewMessage {
    let Some(message) = MessageParser::default().parse(raw) else {
        warn!("Failed to parse email of {} bytes", raw.len());
        return NewMessage {
            from: String::new(),
            to: String::new(),
            subject: String::new(),
            date: String::new(),
            plain_body: BODY_ERROR.to_string(),
            html_body: None,
            envelope,
            size: raw.len(),
        };
    };

    let content = content_or_error(&message);
    NewMessage {
        from: header_text(&message, HeaderName::From),
        to: header_text(&message, HeaderName::To),
        subject: header_text(&message, HeaderName::Subject),
        date: header_text(&message, HeaderName::Date),
        plain_body: content.plain,
        html_body: content.html,
        envelope,
        size: raw.len(),
    }
}

fn content_or_error(message: &ParsedMail<'_>) -> Content {
    extract_from(message).unwrap_or_else(|e| {
        warn!("Failed to read email body: {}", e);
        Content::unreadable()
    })
}

fn extract_from(message: &ParsedMail<'_>) -> Result<Content, ExtractError> {
    let root = message.parts.first().ok_or(ExtractError::NoBody)?;

    let (plain, html) = if matches!(root.body, PartType::Multipart(_)) {
        // First text/html and first text/plain win.
        let mut plain = None;
        let mut html = None;
        for part in &message.parts {
            if html.is_none() && is_text(part, "html") {
                html = Some(decode_part(part)?);
            } else if plain.is_none() && is_text(part, "plain") {
                plain = Some(decode_part(part)?);
            }
        }
        (plain, html)
    } else {
        let body = decode_part(root)?;
        if is_text(root, "html") {
            (None, Some(body))
        } else {
            (Some(body), None)
        }
    };

    let plain = plain.filter(|p| !p.trim().is_empty());
    let html = html.filter(|h| !h.trim().is_empty());

    match (plain, html) {
        (Some(plain), html) => Ok(Content { plain, html }),
        (None, Some(html)) => Ok(Content {
            plain: html_to_text(&html)?,
            html: Some(html),
        }),
        (None, None) => Err(ExtractError::NoBody),
    }
}

/// Renders HTML as readable text. Links and images become bracketed
/// references, emphasis becomes `*`/`**` markers.
fn html_to_text(html: &str) -> Result<String, ExtractError> {
    let html = mark_strong(html);
    let text = html2text::config::plain().string_from_read(html.as_bytes(), HTML_TEXT_WIDTH)?;
    Ok(text.trim_end().to_string())
}

/// Swaps `<b>` and `<strong>` tags for literal `**`; the plain renderer
/// would otherwise drop them.
fn mark_strong(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let Some(close) = tail.find('>') else {
            rest = tail;
            break;
        };

        let name = tail[1..close]
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or_default();
        if name.eq_ignore_ascii_case("b") || name.eq_ignore_ascii_case("strong") {
            out.push_str("**");
        } else {
            out.push_str(&tail[..=close]);
        }
        rest = &tail[close + 1..];
    }
    out.push_str(rest);
    out
}

fn is_text(part: &MessagePart<'_>, subtype: &str) -> bool {
    match part.content_type() {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case("text")
                && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case(subtype))
        }
        // Untyped leaf parts default to text/plain.
        None => subtype == "plain" && matches!(part.body, PartType::Text(_)),
    }
}

fn decode_part(part: &MessagePart<'_>) -> Result<String, ExtractError> {
    match &part.body {
        PartType::Text(text) | PartType::Html(text) => Ok(text.to_string()),
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::Undecodable)
        }
        _ => Err(ExtractError::Undecodable),
    }
}

fn header_text<'x>(message: &ParsedMail<'x>, name: HeaderName<'x>) -> String {
    message.header_raw(name).map(unfold).unwrap_or_default()
}

fn unfold(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
