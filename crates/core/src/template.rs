//! Recommendation message templates.
//!
//! A template is plain text with `{...}` placeholders. A placeholder is either a fact reference
//! (`{latest(hba1c)}`, `{therapy_days(biguanide)}`) rendered from the patient's fact base, or
//! `{threshold(name)}` rendered from the effective value of a named threshold, so overlay
//! overrides show up in the message.

use crate::facts::{FactBase, FactRef};
use std::collections::BTreeMap;

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Text(String),
    Fact(FactRef),
    Threshold(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl MessageTemplate {
    /// Parses a template.
    ///
    /// # Errors
    ///
    /// Returns a description of an unbalanced brace or an unknown fact placeholder.
    pub fn parse(source: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find(['{', '}']) {
            if rest[open..].starts_with('}') {
                return Err(format!("unmatched '}}' in message template '{source}'"));
            }
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after = &rest[open + 1..];
            let close = after
                .find('}')
                .ok_or_else(|| format!("unclosed '{{' in message template '{source}'"))?;
            let inner = after[..close].trim();
            if inner.contains('{') {
                return Err(format!("nested '{{' in message template '{source}'"));
            }

            let segment = match inner
                .strip_prefix("threshold(")
                .and_then(|s| s.strip_suffix(')'))
            {
                Some(param) => Segment::Threshold(param.trim().to_string()),
                None => Segment::Fact(
                    inner
                        .parse::<FactRef>()
                        .map_err(|e| format!("placeholder {{{inner}}}: {e}"))?,
                ),
            };
            segments.push(segment);
            rest = &after[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of `{threshold(..)}` placeholders.
    pub fn threshold_params(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Threshold(param) => Some(param.as_str()),
            _ => None,
        })
    }

    /// Facts read by `{fact}` placeholders.
    pub fn facts(&self) -> impl Iterator<Item = &FactRef> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Fact(fact) => Some(fact),
            _ => None,
        })
    }

    /// Renders the template. A threshold missing from `thresholds` renders as `?`.
    pub fn render(&self, facts: &FactBase, thresholds: &BTreeMap<String, f64>) -> String {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Fact(fact) => out.push_str(&facts.value(fact).to_string()),
                Segment::Threshold(param) => match thresholds.get(param) {
                    Some(value) => out.push_str(&value.to_string()),
                    None => out.push('?'),
                },
            }
        }
        out
    }
}
