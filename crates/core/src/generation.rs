//! Generation request intake: kinds, parsing, and validation.
//!
//! The presentation layer hands over a loosely typed
//! [`NewGenerationRequest`]; [`GenerationRequest::from_new`] turns it into
//! the immutable request a job owns. Parameters are passed through to the
//! backing generation capability untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

/// Which external generation capability a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationKind {
    Chat,
    Image,
    Video,
    Music,
    Slides,
}

/// All recognized kinds, in console navigation order.
pub const ALL_KINDS: &[GenerationKind] = &[
    GenerationKind::Chat,
    GenerationKind::Image,
    GenerationKind::Video,
    GenerationKind::Music,
    GenerationKind::Slides,
];

impl GenerationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Image => "image",
            Self::Video => "video",
            Self::Music => "music",
            Self::Slides => "slides",
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GenerationKind {
    type Err = CoreError;

    /// Case-insensitive. `ppt` is accepted as an alias of `slides`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "music" => Ok(Self::Music),
            "slides" | "ppt" => Ok(Self::Slides),
            other => Err(CoreError::InvalidRequest(format!(
                "Unsupported generation kind '{other}'. Must be one of: {}",
                ALL_KINDS
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Unvalidated request body as produced by a presentation form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewGenerationRequest {
    pub kind: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl NewGenerationRequest {
    pub fn new(kind: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            parameters,
        }
    }
}

/// How much of the parameter map is checked at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterRules {
    /// Only the kind and the presence of parameters are checked.
    #[default]
    Structural,
    /// Additionally require the per-kind input fields the console forms
    /// refused to submit without.
    Strict,
}

/// A validated, immutable generation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    kind: GenerationKind,
    parameters: serde_json::Value,
}

impl GenerationRequest {
    /// Build a request from an already-typed kind.
    ///
    /// Fails with [`CoreError::InvalidRequest`] when `parameters` is JSON
    /// `null`.
    pub fn new(kind: GenerationKind, parameters: serde_json::Value) -> Result<Self, CoreError> {
        if parameters.is_null() {
            return Err(CoreError::InvalidRequest(format!(
                "Parameters are required for a {kind} request"
            )));
        }
        Ok(Self { kind, parameters })
    }

    /// Validate an incoming request body.
    pub fn from_new(new: NewGenerationRequest, rules: ParameterRules) -> Result<Self, CoreError> {
        let kind: GenerationKind = new.kind.parse()?;
        let request = Self::new(kind, new.parameters)?;
        if rules == ParameterRules::Strict {
            request.check_required_fields()?;
        }
        Ok(request)
    }

    pub fn kind(&self) -> GenerationKind {
        self.kind
    }

    pub fn parameters(&self) -> &serde_json::Value {
        &self.parameters
    }

    /// Look up a top-level string parameter.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    fn has_text(&self, key: &str) -> bool {
        self.str_param(key).is_some_and(|s| !s.trim().is_empty())
    }

    fn check_required_fields(&self) -> Result<(), CoreError> {
        let ok = match self.kind {
            GenerationKind::Chat | GenerationKind::Image | GenerationKind::Video => {
                self.has_text("prompt")
            }
            GenerationKind::Music => self.has_text("title"),
            GenerationKind::Slides => {
                self.has_text("title") || self.has_text("text") || self.has_text("file")
            }
        };
        if ok {
            return Ok(());
        }
        let needed = match self.kind {
            GenerationKind::Chat | GenerationKind::Image | GenerationKind::Video => "'prompt'",
            GenerationKind::Music => "'title'",
            GenerationKind::Slides => "one of 'title', 'text' or 'file'",
        };
        Err(CoreError::InvalidRequest(format!(
            "A {} request needs a non-blank {needed}",
            self.kind
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
