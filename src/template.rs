//! Parse and render the path-format template (spec.md §4.2).
//!
//! A template is a sequence of segments, each of which is literal text with
//! `{token}` placeholders, e.g. `"{semester-lexical}/{course}/{type}/
//! {short-path}/{name}"`.

use crate::error::{CampusFsError, Result};
use crate::model::DataField;
use regex::Regex;
use std::sync::OnceLock;

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-zA-Z0-9_-]+)\}").unwrap())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub raw: String,
    pub fields: Vec<String>,
}

impl Segment {
    fn parse(raw: &str) -> Segment {
        let fields = token_re()
            .captures_iter(raw)
            .map(|c| c[1].to_string())
            .collect();
        Segment {
            raw: raw.to_owned(),
            fields,
        }
    }

    /// Render this segment against a token map; fails loudly listing every
    /// missing token if any required token is absent.
    pub fn render(&self, tokens: &std::collections::BTreeMap<String, String>) -> Result<String> {
        let missing: Vec<&String> = self.fields.iter().filter(|f| !tokens.contains_key(*f)).collect();
        if !missing.is_empty() {
            return Err(CampusFsError::Protocol(format!(
                "template segment {:?} is missing tokens: {:?}",
                self.raw, missing
            )));
        }
        let mut out = self.raw.clone();
        for field in &self.fields {
            out = out.replacen(&format!("{{{field}}}"), &tokens[field], 1);
        }
        Ok(out)
    }

    /// The minimal set of [`DataField`]s this segment's tokens require
    /// (spec.md §4.2's fixed field→DataField table).
    pub fn required_data(&self) -> Vec<DataField> {
        let mut out = Vec::new();
        for field in &self.fields {
            let required = match field.as_str() {
                "semester" | "semester-lexical" | "semester-lexical-short" => DataField::Semester,
                "time" if self.fields.len() == 1 => DataField::Semester,
                "course" | "course-id" | "type" | "type-abbrev" | "class" => DataField::Course,
                "path" | "short-path" | "id" | "name" | "description" | "author" | "created"
                | "changed" => DataField::File,
                _ => continue,
            };
            if !out.contains(&required) {
                out.push(required);
            }
        }
        out.sort();
        out
    }

    /// A segment whose only file-related token is `path`/`short-path`
    /// represents a path itself, so it may choose to stay on the same
    /// segment while recursing through a folder (spec.md §9 "expand loop").
    pub fn is_path_like(&self) -> bool {
        self.fields.len() == 1 && matches!(self.fields[0].as_str(), "path" | "short-path")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    pub fn parse(format: &str) -> Template {
        let segments = format
            .split('/')
            .filter(|s| !s.is_empty())
            .map(Segment::parse)
            .collect();
        Template { segments }
    }
}
