//! Attendee ticket rendered as SVG from `templates/ticket/ticket.svg.tera`.

use meetbot_core::template::error_chain;
use tera::{Context, Tera};
use thiserror::Error;

const TICKET_TEMPLATE: &str = include_str!("../../../templates/ticket/ticket.svg.tera");
const TEMPLATE_NAME: &str = "ticket.svg.tera";

pub const TICKET_FILE_NAME: &str = "ticket.svg";
pub const TICKET_CONTENT_TYPE: &str = "image/svg+xml";

const TITLE_CHARS_PER_LINE: usize = 25;
const NAME_CHARS_PER_LINE: usize = 15;

const AVATAR_PALETTE: &[&str] =
    &["#406f58", "#4a6fa5", "#8e5572", "#c47f2c", "#5c6b73", "#2f8f83", "#7a5c99", "#b5523b"];

/// Everything printed on one ticket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub title: String,
    pub attendee: String,
    pub email: String,
    /// Date and venue line, e.g. "01.04.2020, BC Olympia Park".
    pub when_where: String,
    pub note: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TicketError {
    #[error("ticket template does not parse: {0}")]
    Template(String),
    #[error("ticket rendering failed: {0}")]
    Render(String),
}

pub struct TicketRenderer {
    tera: Tera,
}

impl TicketRenderer {
    pub fn new() -> Result<Self, TicketError> {
        Self::from_template(TICKET_TEMPLATE)
    }

    pub fn from_template(source: &str) -> Result<Self, TicketError> {
        let mut tera = Tera::default();
        tera.autoescape_on(vec![".svg.tera"]);
        tera.add_raw_template(TEMPLATE_NAME, source)
            .map_err(|error| TicketError::Template(error_chain(&error)))?;
        Ok(Self { tera })
    }

    pub fn render(&self, ticket: &Ticket) -> Result<String, TicketError> {
        let mut context = Context::new();
        context.insert("title_lines", &wrap(&ticket.title, TITLE_CHARS_PER_LINE));
        context.insert("name_lines", &wrap(&ticket.attendee, NAME_CHARS_PER_LINE));
        context.insert("initials", &initials(&ticket.attendee));
        context.insert("avatar_color", avatar_color(&ticket.email));
        context.insert("location", &ticket.when_where);
        context.insert("note", &ticket.note);

        self.tera
            .render(TEMPLATE_NAME, &context)
            .map_err(|error| TicketError::Render(error_chain(&error)))
    }
}

/// Greedy word wrap by character count; words longer than `width` are split.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for word in text.split_whitespace() {
        let mut rest = word;
        while !rest.is_empty() {
            let rest_len = rest.chars().count();
            if current_len == 0 && rest_len > width {
                let split = rest.char_indices().nth(width).map_or(rest.len(), |(index, _)| index);
                lines.push(rest[..split].to_owned());
                rest = &rest[split..];
            } else if current_len == 0 {
                current.push_str(rest);
                current_len = rest_len;
                rest = "";
            } else if current_len + 1 + rest_len <= width {
                current.push(' ');
                current.push_str(rest);
                current_len += 1 + rest_len;
                rest = "";
            } else {
                lines.push(std::mem::take(&mut current));
                current_len = 0;
            }
        }
    }

    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Up to two uppercase initials; `?` for a blank name.
pub fn initials(name: &str) -> String {
    let letters: String = name
        .split_whitespace()
        .filter_map(|word| word.chars().find(|ch| ch.is_alphanumeric()))
        .take(2)
        .flat_map(char::to_uppercase)
        .collect();
    if letters.is_empty() {
        "?".to_owned()
    } else {
        letters
    }
}

/// Stable avatar color derived from the e-mail (FNV-1a).
pub fn avatar_color(email: &str) -> &'static str {
    let hash = email.trim().to_lowercase().bytes().fold(0x811c_9dc5_u32, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
    });
    AVATAR_PALETTE[hash as usize % AVATAR_PALETTE.len()]
}
