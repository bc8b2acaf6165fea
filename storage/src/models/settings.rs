//! Per-chat settings: stored record with optional fields, the process-wide
//! default table, the resolved view readers see, and the enumerated patch type.
//!
//! Resolution is a pure function of (stored record, defaults): every field the
//! stored record leaves unset is taken from [`SettingsDefaults`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};

const MAX_TEMPERATURE: f32 = 2.0;

/// Content-safety blocking level passed to the generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

impl SafetyThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyThreshold::BlockNone => "block_none",
            SafetyThreshold::BlockOnlyHigh => "block_only_high",
            SafetyThreshold::BlockMediumAndAbove => "block_medium_and_above",
            SafetyThreshold::BlockLowAndAbove => "block_low_and_above",
        }
    }
}

impl fmt::Display for SafetyThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SafetyThreshold {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block_none" | "none" => Ok(SafetyThreshold::BlockNone),
            "block_only_high" | "high" => Ok(SafetyThreshold::BlockOnlyHigh),
            "block_medium_and_above" | "medium" => Ok(SafetyThreshold::BlockMediumAndAbove),
            "block_low_and_above" | "low" => Ok(SafetyThreshold::BlockLowAndAbove),
            other => Err(StorageError::Validation(format!(
                "unknown safety threshold: {}",
                other
            ))),
        }
    }
}

/// Limit on how often the bot answers direct replies in a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectReplyLimit {
    pub enabled: bool,
    pub count: u32,
    pub window: Duration,
}

/// Process-wide default table; immutable for the lifetime of a store.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsDefaults {
    pub conversation_style: String,
    pub temperature: f32,
    pub model: String,
    pub safety_threshold: SafetyThreshold,
    pub voice_transcription_enabled: bool,
    pub direct_reply_limit: DirectReplyLimit,
    pub srach_analysis_enabled: bool,
}

impl Default for SettingsDefaults {
    fn default() -> Self {
        Self {
            conversation_style: "standard".to_string(),
            temperature: 1.0,
            model: "gpt-4o-mini".to_string(),
            safety_threshold: SafetyThreshold::BlockOnlyHigh,
            voice_transcription_enabled: true,
            direct_reply_limit: DirectReplyLimit {
                enabled: false,
                count: 3,
                window: Duration::from_secs(600),
            },
            srach_analysis_enabled: false,
        }
    }
}

impl SettingsDefaults {
    pub fn validate(&self) -> Result<()> {
        SettingsPatch::ConversationStyle(self.conversation_style.clone()).validate()?;
        SettingsPatch::Temperature(self.temperature).validate()?;
        SettingsPatch::Model(self.model.clone()).validate()?;
        SettingsPatch::DirectReplyLimitWindow(self.direct_reply_limit.window).validate()?;
        Ok(())
    }
}

/// Stored settings record. `None` means "not set for this chat".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatSettings {
    pub chat_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_threshold: Option<SafetyThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_transcription_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_reply_limit_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_reply_limit_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_reply_limit_window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub srach_analysis_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ChatSettings {
    /// Record with no field set.
    pub fn empty(chat_id: i64) -> Self {
        Self {
            chat_id,
            ..Default::default()
        }
    }

    /// Record with every field set from the default table.
    pub fn from_defaults(chat_id: i64, defaults: &SettingsDefaults) -> Self {
        Self {
            chat_id,
            conversation_style: Some(defaults.conversation_style.clone()),
            temperature: Some(defaults.temperature),
            model: Some(defaults.model.clone()),
            safety_threshold: Some(defaults.safety_threshold),
            voice_transcription_enabled: Some(defaults.voice_transcription_enabled),
            direct_reply_limit_enabled: Some(defaults.direct_reply_limit.enabled),
            direct_reply_limit_count: Some(defaults.direct_reply_limit.count),
            direct_reply_limit_window_secs: Some(defaults.direct_reply_limit.window.as_secs()),
            srach_analysis_enabled: Some(defaults.srach_analysis_enabled),
            updated_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    pub fn missing_fields(&self) -> Vec<SettingsField> {
        SettingsField::ALL
            .into_iter()
            .filter(|field| !self.is_set(*field))
            .collect()
    }

    pub fn is_set(&self, field: SettingsField) -> bool {
        match field {
            SettingsField::ConversationStyle => self.conversation_style.is_some(),
            SettingsField::Temperature => self.temperature.is_some(),
            SettingsField::Model => self.model.is_some(),
            SettingsField::SafetyThreshold => self.safety_threshold.is_some(),
            SettingsField::VoiceTranscription => self.voice_transcription_enabled.is_some(),
            SettingsField::DirectReplyLimitEnabled => self.direct_reply_limit_enabled.is_some(),
            SettingsField::DirectReplyLimitCount => self.direct_reply_limit_count.is_some(),
            SettingsField::DirectReplyLimitWindow => self.direct_reply_limit_window_secs.is_some(),
            SettingsField::SrachAnalysis => self.srach_analysis_enabled.is_some(),
        }
    }

    /// Sets every unset field from `other`; fields already set are kept.
    pub fn fill_missing(&mut self, other: &ChatSettings) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                *slot = value.clone();
            }
        }
        fill(&mut self.conversation_style, &other.conversation_style);
        fill(&mut self.temperature, &other.temperature);
        fill(&mut self.model, &other.model);
        fill(&mut self.safety_threshold, &other.safety_threshold);
        fill(&mut self.voice_transcription_enabled, &other.voice_transcription_enabled);
        fill(&mut self.direct_reply_limit_enabled, &other.direct_reply_limit_enabled);
        fill(&mut self.direct_reply_limit_count, &other.direct_reply_limit_count);
        fill(&mut self.direct_reply_limit_window_secs, &other.direct_reply_limit_window_secs);
        fill(&mut self.srach_analysis_enabled, &other.srach_analysis_enabled);
    }

    /// Every set field as a patch; used to validate whole-record writes.
    pub fn patches(&self) -> Vec<SettingsPatch> {
        let mut out = Vec::new();
        if let Some(v) = &self.conversation_style {
            out.push(SettingsPatch::ConversationStyle(v.clone()));
        }
        if let Some(v) = self.temperature {
            out.push(SettingsPatch::Temperature(v));
        }
        if let Some(v) = &self.model {
            out.push(SettingsPatch::Model(v.clone()));
        }
        if let Some(v) = self.safety_threshold {
            out.push(SettingsPatch::SafetyThreshold(v));
        }
        if let Some(v) = self.voice_transcription_enabled {
            out.push(SettingsPatch::VoiceTranscription(v));
        }
        if let Some(v) = self.direct_reply_limit_enabled {
            out.push(SettingsPatch::DirectReplyLimitEnabled(v));
        }
        if let Some(v) = self.direct_reply_limit_count {
            out.push(SettingsPatch::DirectReplyLimitCount(i64::from(v)));
        }
        if let Some(v) = self.direct_reply_limit_window_secs {
            out.push(SettingsPatch::DirectReplyLimitWindow(Duration::from_secs(v)));
        }
        if let Some(v) = self.srach_analysis_enabled {
            out.push(SettingsPatch::SrachAnalysis(v));
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        self.patches().iter().try_for_each(SettingsPatch::validate)
    }

    /// Default-overlay resolution. Pure: no storage access.
    pub fn resolve(&self, defaults: &SettingsDefaults) -> ResolvedChatSettings {
        ResolvedChatSettings {
            chat_id: self.chat_id,
            conversation_style: self
                .conversation_style
                .clone()
                .unwrap_or_else(|| defaults.conversation_style.clone()),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            model: self.model.clone().unwrap_or_else(|| defaults.model.clone()),
            safety_threshold: self.safety_threshold.unwrap_or(defaults.safety_threshold),
            voice_transcription_enabled: self
                .voice_transcription_enabled
                .unwrap_or(defaults.voice_transcription_enabled),
            direct_reply_limit: DirectReplyLimit {
                enabled: self
                    .direct_reply_limit_enabled
                    .unwrap_or(defaults.direct_reply_limit.enabled),
                count: self
                    .direct_reply_limit_count
                    .unwrap_or(defaults.direct_reply_limit.count),
                window: self
                    .direct_reply_limit_window_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.direct_reply_limit.window),
            },
            srach_analysis_enabled: self
                .srach_analysis_enabled
                .unwrap_or(defaults.srach_analysis_enabled),
        }
    }
}

/// Fully populated settings as seen by readers.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChatSettings {
    pub chat_id: i64,
    pub conversation_style: String,
    pub temperature: f32,
    pub model: String,
    pub safety_threshold: SafetyThreshold,
    pub voice_transcription_enabled: bool,
    pub direct_reply_limit: DirectReplyLimit,
    pub srach_analysis_enabled: bool,
}

/// Names of the individually patchable settings fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsField {
    ConversationStyle,
    Temperature,
    Model,
    SafetyThreshold,
    VoiceTranscription,
    DirectReplyLimitEnabled,
    DirectReplyLimitCount,
    DirectReplyLimitWindow,
    SrachAnalysis,
}

impl SettingsField {
    pub const ALL: [SettingsField; 9] = [
        SettingsField::ConversationStyle,
        SettingsField::Temperature,
        SettingsField::Model,
        SettingsField::SafetyThreshold,
        SettingsField::VoiceTranscription,
        SettingsField::DirectReplyLimitEnabled,
        SettingsField::DirectReplyLimitCount,
        SettingsField::DirectReplyLimitWindow,
        SettingsField::SrachAnalysis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingsField::ConversationStyle => "conversation_style",
            SettingsField::Temperature => "temperature",
            SettingsField::Model => "model",
            SettingsField::SafetyThreshold => "safety_threshold",
            SettingsField::VoiceTranscription => "voice_transcription_enabled",
            SettingsField::DirectReplyLimitEnabled => "direct_reply_limit_enabled",
            SettingsField::DirectReplyLimitCount => "direct_reply_limit_count",
            SettingsField::DirectReplyLimitWindow => "direct_reply_limit_window_secs",
            SettingsField::SrachAnalysis => "srach_analysis_enabled",
        }
    }
}

impl fmt::Display for SettingsField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SettingsField {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_lowercase();
        SettingsField::ALL
            .into_iter()
            .find(|field| field.as_str() == name)
            .ok_or_else(|| StorageError::Validation(format!("unknown settings field: {}", s)))
    }
}

/// Single-field settings update.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingsPatch {
    ConversationStyle(String),
    Temperature(f32),
    Model(String),
    SafetyThreshold(SafetyThreshold),
    VoiceTranscription(bool),
    DirectReplyLimitEnabled(bool),
    /// Signed so that negative input is reported as a validation error.
    DirectReplyLimitCount(i64),
    DirectReplyLimitWindow(Duration),
    SrachAnalysis(bool),
}

impl SettingsPatch {
    /// Parses `value` for the named field and validates it.
    pub fn parse(field: &str, value: &str) -> Result<Self> {
        let field: SettingsField = field.parse()?;
        let value = value.trim();
        let invalid = |what: &str| {
            StorageError::Validation(format!("invalid value for {}: {} ({})", field, value, what))
        };
        let patch = match field {
            SettingsField::ConversationStyle => SettingsPatch::ConversationStyle(value.to_string()),
            SettingsField::Temperature => SettingsPatch::Temperature(
                value.parse().map_err(|_| invalid("expected a number"))?,
            ),
            SettingsField::Model => SettingsPatch::Model(value.to_string()),
            SettingsField::SafetyThreshold => SettingsPatch::SafetyThreshold(value.parse()?),
            SettingsField::VoiceTranscription => SettingsPatch::VoiceTranscription(
                parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?,
            ),
            SettingsField::DirectReplyLimitEnabled => SettingsPatch::DirectReplyLimitEnabled(
                parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?,
            ),
            SettingsField::DirectReplyLimitCount => SettingsPatch::DirectReplyLimitCount(
                value.parse().map_err(|_| invalid("expected an integer"))?,
            ),
            SettingsField::DirectReplyLimitWindow => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| invalid("expected a number of seconds"))?;
                SettingsPatch::DirectReplyLimitWindow(Duration::from_secs(secs))
            }
            SettingsField::SrachAnalysis => SettingsPatch::SrachAnalysis(
                parse_bool(value).ok_or_else(|| invalid("expected a boolean"))?,
            ),
        };
        patch.validate()?;
        Ok(patch)
    }

    pub fn field(&self) -> SettingsField {
        match self {
            SettingsPatch::ConversationStyle(_) => SettingsField::ConversationStyle,
            SettingsPatch::Temperature(_) => SettingsField::Temperature,
            SettingsPatch::Model(_) => SettingsField::Model,
            SettingsPatch::SafetyThreshold(_) => SettingsField::SafetyThreshold,
            SettingsPatch::VoiceTranscription(_) => SettingsField::VoiceTranscription,
            SettingsPatch::DirectReplyLimitEnabled(_) => SettingsField::DirectReplyLimitEnabled,
            SettingsPatch::DirectReplyLimitCount(_) => SettingsField::DirectReplyLimitCount,
            SettingsPatch::DirectReplyLimitWindow(_) => SettingsField::DirectReplyLimitWindow,
            SettingsPatch::SrachAnalysis(_) => SettingsField::SrachAnalysis,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            SettingsPatch::ConversationStyle(s) | SettingsPatch::Model(s) if s.trim().is_empty() => {
                Err(StorageError::Validation(format!("{} must not be empty", self.field())))
            }
            SettingsPatch::Temperature(t) if !t.is_finite() || *t < 0.0 || *t > MAX_TEMPERATURE => {
                Err(StorageError::Validation(format!(
                    "temperature must be within 0.0..={}, got {}",
                    MAX_TEMPERATURE, t
                )))
            }
            SettingsPatch::DirectReplyLimitCount(n) if *n < 0 || *n > u32::MAX as i64 => Err(
                StorageError::Validation(format!("direct reply limit count out of range: {}", n)),
            ),
            SettingsPatch::DirectReplyLimitWindow(w) if w.as_secs() == 0 => Err(
                StorageError::Validation("direct reply limit window must be at least 1s".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Writes the value into `record`. Call [`SettingsPatch::validate`] first.
    pub fn apply(&self, record: &mut ChatSettings) {
        match self {
            SettingsPatch::ConversationStyle(v) => record.conversation_style = Some(v.clone()),
            SettingsPatch::Temperature(v) => record.temperature = Some(*v),
            SettingsPatch::Model(v) => record.model = Some(v.clone()),
            SettingsPatch::SafetyThreshold(v) => record.safety_threshold = Some(*v),
            SettingsPatch::VoiceTranscription(v) => record.voice_transcription_enabled = Some(*v),
            SettingsPatch::DirectReplyLimitEnabled(v) => {
                record.direct_reply_limit_enabled = Some(*v)
            }
            SettingsPatch::DirectReplyLimitCount(v) => {
                record.direct_reply_limit_count = Some((*v).clamp(0, u32::MAX as i64) as u32)
            }
            SettingsPatch::DirectReplyLimitWindow(v) => {
                record.direct_reply_limit_window_secs = Some(v.as_secs())
            }
            SettingsPatch::SrachAnalysis(v) => record.srach_analysis_enabled = Some(*v),
        }
    }
}

/// Accepts 1/0, true/false, yes/no, on/off (case-insensitive).
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
