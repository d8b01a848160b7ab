//! Document formats for export and import.
//!
//! # Responsibility
//! - Render one note as a Markdown or HTML document.
//! - Parse supported document files back into a title and a body.
//! - Map display names to portable file names.
//!
//! # Invariants
//! - `parse(render(title, body))` yields the same title and body.
//! - File names never contain path separators or reserved characters.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

static RESERVED_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[\\/:*?"<>|\x00-\x1f]"#).expect("valid reserved character regex")
});
static HTML_TITLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid html title regex")
});
static HTML_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<body[^>]*>(.*)</body>").expect("valid html body regex")
});
static HTML_CONTENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<div class="content">(.*)</div>"#).expect("valid html content regex")
});
static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid html tag regex"));
static HTML_ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").expect("valid html entity regex")
});

/// Output format of an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Markdown,
    Html,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Html => "html",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "markdown" | "md" => Some(Self::Markdown),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Html => "html",
        }
    }

    pub fn render(self, title: &str, body: &str) -> String {
        match self {
            Self::Markdown => format!("# {title}\n\n{body}"),
            Self::Html => {
                let title = escape_html(title);
                format!(
                    "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n</head>\n<body>\n<h1>{title}</h1>\n<div class=\"content\">{}</div>\n</body>\n</html>\n",
                    escape_html(body)
                )
            }
        }
    }
}

/// Title and body recovered from one document file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedNote {
    pub(crate) title: String,
    pub(crate) body: String,
}

/// How a file found during import is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SourceKind {
    Markdown,
    PlainText,
    Html,
}

impl SourceKind {
    pub(crate) fn of(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "md" | "markdown" => Some(Self::Markdown),
            "txt" => Some(Self::PlainText),
            "html" | "htm" => Some(Self::Html),
            _ => None,
        }
    }
}

/// Parses a document; `fallback_title` is used when the file names none.
pub(crate) fn parse_document(
    kind: SourceKind,
    bytes: &[u8],
    fallback_title: &str,
) -> Result<ParsedNote, String> {
    let text = std::str::from_utf8(bytes).map_err(|err| format!("not valid UTF-8: {err}"))?;
    match kind {
        SourceKind::Markdown => Ok(parse_markdown(text, fallback_title)),
        SourceKind::PlainText => Ok(ParsedNote {
            title: fallback_title.to_string(),
            body: text.to_string(),
        }),
        SourceKind::Html => parse_html(text, fallback_title),
    }
}

fn parse_markdown(text: &str, fallback_title: &str) -> ParsedNote {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let (first, rest) = match text.split_once('\n') {
        Some((first, rest)) => (first, Some(rest)),
        None => (text, None),
    };
    let heading = first
        .trim_end_matches('\r')
        .strip_prefix("# ")
        .map(str::trim)
        .filter(|title| !title.is_empty());
    match heading {
        Some(title) => {
            let rest = rest.unwrap_or_default();
            let body = rest
                .strip_prefix("\r\n")
                .or_else(|| rest.strip_prefix('\n'))
                .unwrap_or(rest);
            ParsedNote {
                title: title.to_string(),
                body: body.to_string(),
            }
        }
        None => ParsedNote {
            title: fallback_title.to_string(),
            body: text.to_string(),
        },
    }
}

fn parse_html(text: &str, fallback_title: &str) -> Result<ParsedNote, String> {
    let body_html = HTML_BODY
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|body| body.as_str())
        .ok_or_else(|| "html document has no <body>".to_string())?;
    let title = HTML_TITLE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|title| unescape_html(title.as_str().trim()))
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| fallback_title.to_string());
    let body = match HTML_CONTENT
        .captures(body_html)
        .and_then(|captures| captures.get(1))
    {
        Some(content) => unescape_html(content.as_str()),
        None => unescape_html(HTML_TAG.replace_all(body_html, "").trim()),
    };
    Ok(ParsedNote { title, body })
}

pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub(crate) fn unescape_html(text: &str) -> String {
    HTML_ENTITY
        .replace_all(text, |captures: &regex::Captures<'_>| {
            let entity = &captures[1];
            let decoded = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity.strip_prefix('#').and_then(|number| {
                    let code = match number.strip_prefix(['x', 'X']) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => number.parse().ok(),
                    };
                    code.and_then(char::from_u32)
                }),
            };
            decoded.map_or_else(|| captures[0].to_string(), String::from)
        })
        .into_owned()
}

/// Turns a display name into a portable file or directory name.
pub(crate) fn file_stem_for(display_name: &str) -> String {
    let replaced = RESERVED_CHARS.replace_all(display_name.trim(), "_");
    let trimmed = replaced.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return "_".to_string();
    }
    if trimmed.starts_with('.') {
        return format!("_{trimmed}");
    }
    trimmed.to_string()
}
