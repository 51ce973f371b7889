//! Model references of the form `[host/][namespace/]model[:tag][+build]`

use crate::error::{Result, SchedulerError};
use std::fmt;

/// Longest accepted reference, and longest accepted part
pub const MAX_NAME_PART_LEN: usize = 128;

/// Tag assumed when a reference does not name one
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Host,
    Namespace,
    Model,
    Tag,
    Build,
}

impl Part {
    fn label(&self) -> &'static str {
        match self {
            Part::Host => "host",
            Part::Namespace => "namespace",
            Part::Model => "model",
            Part::Tag => "tag",
            Part::Build => "build",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelName {
    host: String,
    namespace: String,
    model: String,
    tag: String,
    build: String,
}

impl ModelName {
    /// Parse a model reference, rejecting empty or malformed input
    pub fn parse(input: &str) -> Result<Self> {
        let s = input
            .strip_prefix("http://")
            .or_else(|| input.strip_prefix("https://"))
            .unwrap_or(input);

        if s.is_empty() {
            return Err(SchedulerError::InvalidRequest("model name is required".to_string()));
        }
        if s.len() > MAX_NAME_PART_LEN {
            return Err(invalid(input, "name is too long"));
        }

        let (rest, build) = match s.rsplit_once('+') {
            Some((rest, build)) => (rest, Some(build)),
            None => (s, None),
        };

        let (path, tag) = match rest.rsplit_once(':') {
            Some((_, tag)) if tag.contains('/') => {
                return Err(invalid(input, "unexpected ':' before '/'"));
            }
            Some((path, tag)) => (path, Some(tag)),
            None => (rest, None),
        };

        let segments: Vec<&str> = path.split('/').collect();
        let (host, namespace, model) = match segments.as_slice() {
            [model] => ("", "", *model),
            [namespace, model] => ("", *namespace, *model),
            [host, namespace, model] => (*host, *namespace, *model),
            _ => return Err(invalid(input, "too many '/' separated parts")),
        };

        let mut name = ModelName::default();
        if !host.is_empty() || segments.len() == 3 {
            name.host = validate_part(input, Part::Host, host)?.to_string();
        }
        if !namespace.is_empty() || segments.len() >= 2 {
            name.namespace = validate_part(input, Part::Namespace, namespace)?.to_string();
        }
        name.model = validate_part(input, Part::Model, model)?.to_string();
        if let Some(tag) = tag {
            name.tag = validate_part(input, Part::Tag, tag)?.to_string();
        }
        if let Some(build) = build {
            name.build = validate_part(input, Part::Build, build)?.to_uppercase();
        }
        Ok(name)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// The tag, falling back to [`DEFAULT_TAG`]
    pub fn tag(&self) -> &str {
        if self.tag.is_empty() {
            DEFAULT_TAG
        } else {
            &self.tag
        }
    }

    pub fn build(&self) -> &str {
        &self.build
    }

    /// Lower-cased fully spelled out reference, used as a map key
    pub fn canonical(&self) -> String {
        let mut out = String::with_capacity(self.host.len() + self.namespace.len() + self.model.len() + 16);
        if !self.host.is_empty() {
            out.push_str(&self.host);
            out.push('/');
        }
        if !self.namespace.is_empty() {
            out.push_str(&self.namespace);
            out.push('/');
        }
        out.push_str(&self.model);
        out.push(':');
        out.push_str(self.tag());
        if !self.build.is_empty() {
            out.push('+');
            out.push_str(&self.build);
        }
        out.to_ascii_lowercase()
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host.is_empty() {
            write!(f, "{}/", self.host)?;
        }
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        f.write_str(&self.model)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.build.is_empty() {
            write!(f, "+{}", self.build)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ModelName {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        ModelName::parse(s)
    }
}

fn invalid(input: &str, reason: &str) -> SchedulerError {
    SchedulerError::InvalidRequest(format!("invalid model name {:?}: {}", input, reason))
}

fn validate_part<'a>(input: &str, kind: Part, part: &'a str) -> Result<&'a str> {
    if part.is_empty() {
        return Err(invalid(input, &format!("empty {}", kind.label())));
    }
    if part.len() > MAX_NAME_PART_LEN {
        return Err(invalid(input, &format!("{} is too long", kind.label())));
    }
    if let Some(c) = part.bytes().find(|c| !is_valid_byte(kind, *c)) {
        return Err(invalid(
            input,
            &format!("character {:?} not allowed in {}", c as char, kind.label()),
        ));
    }
    Ok(part)
}

fn is_valid_byte(kind: Part, c: u8) -> bool {
    if c == b'.' {
        return kind != Part::Namespace;
    }
    c.is_ascii_alphanumeric() || c == b'_' || c == b'-'
}
