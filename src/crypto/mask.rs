//! Display masking and log redaction
//!
//! Masking is character-aware: multi-byte names and identifiers are
//! counted in chars, never bytes.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::url_decode;

/// Kind of personal data being masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskCategory {
    Phone,
    Email,
    IdCard,
    Name,
}

impl std::str::FromStr for MaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "phone" => Ok(MaskCategory::Phone),
            "email" => Ok(MaskCategory::Email),
            "idcard" | "id_card" => Ok(MaskCategory::IdCard),
            "name" => Ok(MaskCategory::Name),
            _ => Err(format!("Unknown mask category: {}", s)),
        }
    }
}

pub fn mask_sensitive_data(value: &str, category: MaskCategory) -> String {
    match category {
        MaskCategory::Phone => mask_phone(value),
        MaskCategory::Email => mask_email(value),
        MaskCategory::IdCard => mask_id_card(value),
        MaskCategory::Name => mask_name(value),
    }
}

/// `13800138000` -> `138****8000`. Shorter than 7 chars is left alone.
pub fn mask_phone(value: &str) -> String {
    keep_ends(value, 3, 4)
}

/// `user@example.com` -> `us***r@example.com`; `bob@x.io` -> `b***@x.io`
pub fn mask_email(value: &str) -> String {
    let Some((local, domain)) = value.rsplit_once('@') else {
        return value.to_string();
    };
    let chars: Vec<char> = local.chars().collect();

    let masked_local = match chars.len() {
        0 => return value.to_string(),
        1..=3 => format!("{}***", chars[0]),
        n => format!("{}{}***{}", chars[0], chars[1], chars[n - 1]),
    };
    format!("{}@{}", masked_local, domain)
}

/// `110101199001011234` -> `110101********1234`. Shorter than 10 chars is left alone.
pub fn mask_id_card(value: &str) -> String {
    keep_ends(value, 6, 4)
}

/// `张三丰` -> `张*丰`. One- and two-character names are returned unchanged.
pub fn mask_name(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 2 {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    out.push(chars[0]);
    out.extend(std::iter::repeat('*').take(chars.len() - 2));
    out.push(chars[chars.len() - 1]);
    out
}

/// Keep `head` leading and `tail` trailing chars, one `*` per masked char
fn keep_ends(value: &str, head: usize, tail: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < head + tail {
        return value.to_string();
    }
    let masked = chars.len() - head - tail;
    chars[..head]
        .iter()
        .copied()
        .chain(std::iter::repeat('*').take(masked))
        .chain(chars[chars.len() - tail..].iter().copied())
        .collect()
}

/// Replaces values of sensitive keys anywhere in a JSON document, including
/// `key=value` and `key: value` pairs inside string bodies
#[derive(Debug, Clone)]
pub struct Redactor {
    /// Lower-cased field name fragments
    fields: Vec<String>,
    marker: String,
    /// `<key containing a field>` `=`/`:` `<value>` in free text
    inline: Option<Regex>,
}

impl Redactor {
    pub fn new<I, S>(fields: I, marker: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(|f| f.as_ref().to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect();
        let inline = inline_pattern(&fields);
        Self {
            fields,
            marker: marker.into(),
            inline,
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn is_sensitive(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.fields.iter().any(|f| key.contains(f.as_str()))
    }

    pub fn redact(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| {
                        let v = if self.is_sensitive(k) {
                            Value::String(self.marker.clone())
                        } else {
                            self.redact(v)
                        };
                        (k.clone(), v)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.redact(v)).collect()),
            Value::String(text) => Value::String(self.redact_text(text)),
            other => other.clone(),
        }
    }

    /// Mask sensitive values in form-encoded or free text
    pub fn redact_text(&self, text: &str) -> String {
        let Some(inline) = &self.inline else {
            return text.to_string();
        };

        // percent-encoded keys only show up after decoding, so walk the pairs first
        let pairs: Vec<String> = text
            .split('&')
            .map(|pair| match pair.split_once('=') {
                Some((key, _)) if self.is_sensitive(url_decode(key).trim()) => {
                    format!("{}={}", key, self.marker)
                }
                _ => pair.to_string(),
            })
            .collect();
        let joined = pairs.join("&");

        inline
            .replace_all(&joined, |caps: &regex::Captures| {
                if &caps[2] == self.marker.as_str() {
                    caps[0].to_string()
                } else {
                    format!("{}{}", &caps[1], self.marker)
                }
            })
            .into_owned()
    }
}

fn inline_pattern(fields: &[String]) -> Option<Regex> {
    if fields.is_empty() {
        return None;
    }
    let alternation = fields
        .iter()
        .map(|f| regex::escape(f))
        .collect::<Vec<_>>()
        .join("|");
    let pattern = format!(
        r#"([\w.\-\[\]]*(?:{})[\w.\-\[\]]*["']?\s*[:=]\s*["']?)([^&\s"',;}}]+)"#,
        alternation
    );
    RegexBuilder::new(&pattern).case_insensitive(true).build().ok()
}
