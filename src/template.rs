//! `{{token}}` substitution for message text. Flat token lookup only, no
//! conditionals or loops; unknown tokens pass through verbatim so a typo in a
//! flow shows up in the chat instead of vanishing.

use once_cell::sync::Lazy;
use regex::Regex;

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap());

/// Values available to a render, borrowed from the execution record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateVars<'a> {
    pub contact_name: Option<&'a str>,
    pub operator_name: Option<&'a str>,
}

impl<'a> TemplateVars<'a> {
    /// Several token spellings map to the same value; flow builders in the
    /// wild use all of them, in any casing.
    fn resolve(&self, token: &str) -> Option<&'a str> {
        match token.to_lowercase().as_str() {
            "contact_name" | "name" | "contact" => self.contact_name,
            "first_name" => self.contact_name.and_then(|n| n.split_whitespace().next()),
            "operator_name" | "operator" | "owner_name" | "agent_name" => self.operator_name,
            _ => None,
        }
    }
}

pub fn render(text: &str, vars: &TemplateVars<'_>) -> String {
    TOKEN_RE
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match vars.resolve(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
