//! Persona records, the boundary adapter that normalizes them, and voice selection
//!
//! Persona content arrives from upstream in two shapes: a structured record
//! and a generated profile with camel-cased keys and a single system prompt.
//! [`PersonaRecord`] accepts either and [`Persona::from`] turns both into the
//! one normalized [`Persona`] the rest of the client works with.

use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// Normalized persona the agent speaks as
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub company: String,
    /// Instruction fragments joined into the think prompt
    #[serde(default)]
    pub prompt_fragments: Vec<String>,
    /// Behavioural hints ("skeptical", "warm", ...) used for prompting and voice selection
    #[serde(default)]
    pub behavioral_hints: Vec<String>,
    /// Voice requested explicitly by the persona source
    #[serde(default)]
    pub voice_id: Option<String>,
}

impl Persona {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            company: String::new(),
            prompt_fragments: Vec::new(),
            behavioral_hints: Vec::new(),
            voice_id: None,
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = company.into();
        self
    }

    pub fn with_prompt_fragment(mut self, fragment: impl Into<String>) -> Self {
        self.prompt_fragments.push(fragment.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.behavioral_hints.push(hint.into());
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = Some(voice_id.into());
        self
    }

    /// Copy of this persona with its behavioural hints replaced
    pub fn with_behavioral_hints(&self, hints: Vec<String>) -> Self {
        Self {
            behavioral_hints: hints,
            ..self.clone()
        }
    }

    /// Parse either upstream shape from JSON
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let record: PersonaRecord = serde_json::from_value(value)
            .map_err(|e| CallError::Configuration(format!("unrecognised persona record: {e}")))?;
        let persona = Persona::from(record);
        if persona.name.trim().is_empty() {
            return Err(CallError::Configuration("persona name is empty".into()));
        }
        Ok(persona)
    }

    /// Render the think prompt sent to the provider
    pub fn instructions(&self, extra_prompt: Option<&str>) -> String {
        let mut out = if self.company.is_empty() {
            format!("You are {}, {}.", self.name, self.role)
        } else {
            format!("You are {}, {} at {}.", self.name, self.role, self.company)
        };

        for fragment in self.prompt_fragments.iter().filter(|f| !f.trim().is_empty()) {
            out.push('\n');
            out.push_str(fragment.trim());
        }

        if !self.behavioral_hints.is_empty() {
            out.push_str("\nBehaviour: ");
            out.push_str(&self.behavioral_hints.join(", "));
            out.push('.');
        }

        if let Some(extra) = extra_prompt.map(str::trim).filter(|e| !e.is_empty()) {
            out.push('\n');
            out.push_str(extra);
        }

        out
    }

    /// Greeting spoken when the call connects
    pub fn greeting(&self) -> String {
        if self.company.is_empty() {
            format!("Hi, this is {}.", self.name)
        } else {
            format!("Hi, this is {} from {}.", self.name, self.company)
        }
    }
}

/// Either upstream persona shape, accepted at the system boundary
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PersonaRecord {
    Structured(StructuredPersona),
    Generated(GeneratedPersona),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredPersona {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub prompt_fragments: Vec<String>,
    #[serde(default)]
    pub behavioral_hints: Vec<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedPersona {
    pub display_name: String,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub voice: Option<VoiceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceRef {
    pub id: String,
}

impl From<PersonaRecord> for Persona {
    fn from(record: PersonaRecord) -> Self {
        match record {
            PersonaRecord::Structured(p) => Persona {
                name: p.name,
                role: p.role,
                company: p.company,
                prompt_fragments: p.prompt_fragments,
                behavioral_hints: p.behavioral_hints,
                voice_id: p.voice_id.filter(|v| !v.trim().is_empty()),
            },
            PersonaRecord::Generated(p) => Persona {
                name: p.display_name,
                role: p.job_title.unwrap_or_else(|| "prospect".to_string()),
                company: p.organization.unwrap_or_default(),
                prompt_fragments: p
                    .system_prompt
                    .into_iter()
                    .filter(|s| !s.trim().is_empty())
                    .collect(),
                behavioral_hints: p.traits,
                voice_id: p.voice.map(|v| v.id).filter(|v| !v.trim().is_empty()),
            },
        }
    }
}

/// A voice the provider offers, tagged with the traits it suits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceOption {
    pub id: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Voice selection policy
///
/// An explicit persona voice wins. Otherwise the first catalog voice with a
/// tag matching a behavioural hint or the role is chosen, falling back to the
/// configured default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceCatalog {
    #[serde(default)]
    pub voices: Vec<VoiceOption>,
    pub default_voice: String,
}

impl VoiceCatalog {
    pub fn new(default_voice: impl Into<String>) -> Self {
        Self {
            voices: Vec::new(),
            default_voice: default_voice.into(),
        }
    }

    pub fn with_voice(mut self, id: impl Into<String>, tags: &[&str]) -> Self {
        self.voices.push(VoiceOption {
            id: id.into(),
            tags: tags.iter().map(|t| t.to_ascii_lowercase()).collect(),
        });
        self
    }

    pub fn select(&self, persona: &Persona) -> String {
        if let Some(voice) = persona.voice_id.as_deref().filter(|v| !v.is_empty()) {
            return voice.to_string();
        }

        let wanted: Vec<String> = persona
            .behavioral_hints
            .iter()
            .chain(std::iter::once(&persona.role))
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect();

        self.voices
            .iter()
            .find(|voice| {
                voice
                    .tags
                    .iter()
                    .any(|tag| wanted.iter().any(|w| w == &tag.to_ascii_lowercase()))
            })
            .map(|voice| voice.id.clone())
            .unwrap_or_else(|| self.default_voice.clone())
    }
}
