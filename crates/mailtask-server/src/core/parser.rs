use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use mail_parser::{Address, Message, MessageParser as MimeMessageParser};
use thiserror::Error;
use tracing::debug;

use super::item::{Destination, ParsedMessage};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("message is not a parseable MIME document")]
    Malformed,
    #[error("sender address not found (From)")]
    MissingSender,
    #[error("recipient address not found (To/Cc)")]
    MissingRecipient
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed => "MALFORMED",
            Self::MissingSender => "MISSING_SENDER",
            Self::MissingRecipient => "MISSING_RECIPIENT"
        }
    }
}

/// Turns raw RFC 5322 bytes into a `ParsedMessage` with its destination.
pub trait MessageParser: Send + Sync {
    fn parse(
        &self,
        raw: &[u8],
        source_id: u32
    ) -> Result<ParsedMessage, ParseError>;
}

/// Recipient address to destination name, matched exactly after lowercasing.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, String>
}

impl RouteTable {
    pub fn new(routes: &BTreeMap<String, String>) -> Self {
        Self {
            routes: routes
                .iter()
                .map(|(address, destination)| {
                    (address.trim().to_ascii_lowercase(), destination.clone())
                })
                .collect()
        }
    }

    /// First recipient with a route wins.
    pub fn resolve<'a, I>(
        &self,
        recipients: I
    ) -> Destination
    where
        I: IntoIterator<Item = &'a str>,
    {
        recipients
            .into_iter()
            .find_map(|address| self.routes.get(&address.trim().to_ascii_lowercase()))
            .map(|name| Destination::Named(name.clone()))
            .unwrap_or(Destination::Unknown)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// `MessageParser` backed by the `mail-parser` crate.
#[derive(Debug, Clone, Default)]
pub struct MimeParser {
    routes: RouteTable
}

impl MimeParser {
    pub fn new(routes: RouteTable) -> Self {
        Self { routes }
    }
}

impl MessageParser for MimeParser {
    fn parse(
        &self,
        raw: &[u8],
        source_id: u32
    ) -> Result<ParsedMessage, ParseError> {
        let message = message_parser().parse(raw).ok_or(ParseError::Malformed)?;

        let from = message
            .from()
            .and_then(Address::first)
            .and_then(|addr| addr.address())
            .map(str::trim)
            .filter(|address| !address.is_empty())
            .ok_or(ParseError::MissingSender)?
            .to_string();

        let to = recipients(&message);
        if to.is_empty() {
            return Err(ParseError::MissingRecipient);
        }

        let destination = self.routes.resolve(to.iter().map(String::as_str));
        let parsed = ParsedMessage {
            from,
            subject: message.subject().map(str::trim).unwrap_or_default().to_string(),
            body: message
                .body_text(0)
                .map(|text| collapse_whitespace(&text))
                .unwrap_or_default(),
            message_id: message.message_id().map(str::to_string),
            to,
            destination
        };

        debug!(
            "message parsed: uid={}, from={}, to={}, destination={}, body_bytes={}",
            source_id,
            parsed.from,
            parsed.to.join(","),
            parsed.destination,
            parsed.body.len()
        );

        Ok(parsed)
    }
}

fn recipients(message: &Message<'_>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for header in [message.to(), message.cc()].into_iter().flatten() {
        for addr in header.iter() {
            let Some(address) = addr.address().map(str::trim) else {
                continue;
            };
            if !address.is_empty() && !out.iter().any(|seen| seen.eq_ignore_ascii_case(address)) {
                out.push(address.to_string());
            }
        }
    }
    out
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn message_parser() -> &'static MimeMessageParser {
    static PARSER: OnceLock<MimeMessageParser> = OnceLock::new();
    PARSER.get_or_init(MimeMessageParser::default)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn parser() -> MimeParser {
        let mut routes = BTreeMap::new();
        routes.insert("PaceNotes@Example.com".to_string(), "pace_notes".to_string());
        routes.insert("policy@example.com".to_string(), "policy".to_string());
        MimeParser::new(RouteTable::new(&routes))
    }

    #[test]
    fn parses_plain_text_message_and_routes_by_recipient() {
        let raw = concat!(
            "From: Member <member@example.com>\r\n",
            "To: pacenotes@example.com\r\n",
            "Subject:   Weekly notes  \r\n",
            "Message-ID: <abc@example.com>\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "Please   draft\r\n\r\nthe notes.\r\n"
        );

        let parsed = parser().parse(raw.as_bytes(), 1).unwrap();
        assert_eq!(parsed.from, "member@example.com");
        assert_eq!(parsed.to, vec!["pacenotes@example.com".to_string()]);
        assert_eq!(parsed.subject, "Weekly notes");
        assert_eq!(parsed.body, "Please draft the notes.");
        assert_eq!(parsed.message_id.as_deref(), Some("abc@example.com"));
        assert_eq!(parsed.destination, Destination::Named("pace_notes".to_string()));
    }

    #[test]
    fn cc_recipients_are_considered_for_routing() {
        let raw = concat!(
            "From: member@example.com\r\n",
            "To: someone@example.org\r\n",
            "Cc: Policy Desk <POLICY@example.com>\r\n",
            "Subject: leave\r\n",
            "\r\n",
            "body\r\n"
        );

        let parsed = parser().parse(raw.as_bytes(), 2).unwrap();
        assert_eq!(parsed.to.len(), 2);
        assert_eq!(parsed.destination, Destination::Named("policy".to_string()));
    }

    #[test]
    fn unmatched_recipient_is_unknown() {
        let raw = "From: a@example.com\r\nTo: b@example.org\r\nSubject: x\r\n\r\nhi\r\n";
        let parsed = parser().parse(raw.as_bytes(), 3).unwrap();
        assert!(parsed.destination.is_unknown());
    }

    #[test]
    fn html_only_body_is_converted_to_text() {
        let raw = concat!(
            "From: a@example.com\r\n",
            "To: pacenotes@example.com\r\n",
            "Subject: html\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "\r\n",
            "<html><body><p>Hello</p>\r\n<p>world</p></body></html>\r\n"
        );

        let parsed = parser().parse(raw.as_bytes(), 4).unwrap();
        assert!(parsed.body.contains("Hello"));
        assert!(parsed.body.contains("world"));
        assert!(!parsed.body.contains('<'));
    }

    #[test]
    fn missing_sender_or_recipient_is_rejected() {
        let no_from = "To: b@example.org\r\nSubject: x\r\n\r\nhi\r\n";
        assert_eq!(
            parser().parse(no_from.as_bytes(), 5).unwrap_err(),
            ParseError::MissingSender
        );

        let no_to = "From: a@example.com\r\nSubject: x\r\n\r\nhi\r\n";
        let err = parser().parse(no_to.as_bytes(), 6).unwrap_err();
        assert_eq!(err, ParseError::MissingRecipient);
        assert_eq!(err.code(), "MISSING_RECIPIENT");
    }

    #[test]
    fn empty_input_is_not_a_message() {
        assert!(parser().parse(b"", 7).is_err());
    }
}
