// SegmentTemplate identifiers, see ISO/IEC 23009-1 5.3.9.4.4.
//
// Only `%0[width]d` is permitted as a format tag, so the substitution is done with a
// regex instead of a printf implementation.

use regex::{Captures, Regex, Replacer};
use std::sync::LazyLock;

static IDENTIFIER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$")
        .expect("identifier regex is valid")
});

/// Values substituted into `initialization` and `media` templates.
#[derive(Debug, Default, Clone)]
pub struct Template {
    representation_id: Option<String>,
    number: Option<u64>,
    time: Option<u64>,
    bandwidth: Option<u64>,
}

impl Template {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn representation_id(mut self, id: impl Into<String>) -> Self {
        self.representation_id = Some(id.into());
        self
    }

    pub fn number(mut self, number: u64) -> Self {
        self.number = Some(number);
        self
    }

    pub fn time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = Some(bandwidth);
        self
    }

    pub fn resolve(&self, template: &str) -> String {
        IDENTIFIER_REGEX
            .replace_all(template, IdentifierReplacer(self))
            .replace("$$", "$")
    }

    fn lookup(&self, identifier: &str) -> Option<String> {
        match identifier {
            "RepresentationID" => self.representation_id.clone(),
            "Number" => self.number.map(|n| n.to_string()),
            "Time" => self.time.map(|t| t.to_string()),
            "Bandwidth" => self.bandwidth.map(|b| b.to_string()),
            _ => None,
        }
    }
}

struct IdentifierReplacer<'a>(&'a Template);

impl Replacer for IdentifierReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let Some(value) = self.0.lookup(&caps[1]) else {
            dst.push_str(&caps[0]);
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(&value),
        }
    }
}
