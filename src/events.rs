use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

// ============================================================================
// Server → client events
// ============================================================================

/// One JSON message on the generation stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Content {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        word_count: Option<usize>,
    },

    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    Autosave {
        word_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Complete {
        final_word_count: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        generation_id: Option<String>,
    },

    Error(ServerErrorEvent),

    End,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorEvent {
    #[serde(default = "default_error_code")]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, alias = "recoverable")]
    pub can_resume: bool,
    #[serde(default)]
    pub partial_saved: bool,
    #[serde(default)]
    pub saved_word_count: Option<usize>,
}

fn default_error_code() -> String {
    "SERVER_ERROR".to_string()
}

impl ServerEvent {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content {
            content: text.into(),
            word_count: None,
        }
    }

    pub fn complete(final_word_count: usize) -> Self {
        Self::Complete {
            final_word_count,
            generation_id: None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Content { .. } => "content",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Autosave { .. } => "autosave",
            Self::Complete { .. } => "complete",
            Self::Error(_) => "error",
            Self::End => "end",
        }
    }

    /// True for events after which the server sends nothing further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::End)
    }
}

// ============================================================================
// Client → server request
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GenerationType {
    Progressive,
    Outline,
    Improve,
    Section,
    Rephrase,
    Expand,
}

impl GenerationType {
    pub fn is_selection_scoped(&self) -> bool {
        matches!(self, Self::Rephrase | Self::Expand)
    }
}

/// Parameters of one streaming request.
///
/// The resume cursor and generation id are filled in by the session on
/// reconnect; callers leave them empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub url: String,
    pub generation_type: GenerationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_from: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

impl StreamRequest {
    pub fn new(url: impl Into<String>, generation_type: GenerationType) -> Self {
        Self {
            url: url.into(),
            generation_type,
            section_type: None,
            selected_text: None,
            style: None,
            target_words: None,
            resume_from: None,
            generation_id: None,
        }
    }

    pub fn with_section(mut self, section_type: impl Into<String>) -> Self {
        self.section_type = Some(section_type.into());
        self
    }

    pub fn with_selection(mut self, text: impl Into<String>) -> Self {
        self.selected_text = Some(text.into());
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn with_target_words(mut self, words: usize) -> Self {
        self.target_words = Some(words);
        self
    }

    /// Query parameters in wire order.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("generation_type", self.generation_type.to_string())];
        if let Some(v) = &self.section_type {
            pairs.push(("section_type", v.clone()));
        }
        if let Some(v) = &self.selected_text {
            pairs.push(("selected_text", v.clone()));
        }
        if let Some(v) = &self.style {
            pairs.push(("style", v.clone()));
        }
        if let Some(v) = self.target_words {
            pairs.push(("target_words", v.to_string()));
        }
        if let Some(v) = self.resume_from {
            pairs.push(("resume_from", v.to_string()));
        }
        if let Some(v) = &self.generation_id {
            pairs.push(("generation_id", v.clone()));
        }
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_event() {
        let ev: ServerEvent =
            serde_json::from_str(r#"{"type":"content","content":"Hello ","word_count":1}"#).unwrap();
        assert_eq!(
            ev,
            ServerEvent::Content {
                content: "Hello ".to_string(),
                word_count: Some(1)
            }
        );
    }

    #[test]
    fn test_parse_error_event_with_recoverable_alias() {
        let ev: ServerEvent = serde_json::from_str(
            r#"{"type":"error","code":"MODEL_OVERLOADED","message":"busy","recoverable":true,"partial_saved":true,"saved_word_count":200}"#,
        )
        .unwrap();
        match ev {
            ServerEvent::Error(e) => {
                assert!(e.can_resume);
                assert!(e.partial_saved);
                assert_eq!(e.saved_word_count, Some(200));
            }
            other => panic!("Expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_bare_error_defaults() {
        let ev: ServerEvent = serde_json::from_str(r#"{"type":"error"}"#).unwrap();
        match ev {
            ServerEvent::Error(e) => {
                assert_eq!(e.code, "SERVER_ERROR");
                assert!(!e.can_resume);
            }
            other => panic!("Expected error event, got {:?}", other),
        }
    }

    #[test]
    fn test_end_and_heartbeat() {
        let end: ServerEvent = serde_json::from_str(r#"{"type":"end"}"#).unwrap();
        assert!(end.is_terminal());
        let hb: ServerEvent = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(hb.kind(), "heartbeat");
    }

    #[test]
    fn test_query_pairs_include_resume_cursor() {
        let mut req = StreamRequest::new("http://x/stream", GenerationType::Section)
            .with_section("methodology");
        req.resume_from = Some(200);
        req.generation_id = Some("gen-1".to_string());
        let pairs = req.query_pairs();
        assert_eq!(pairs[0], ("generation_type", "section".to_string()));
        assert!(pairs.contains(&("resume_from", "200".to_string())));
        assert!(pairs.contains(&("generation_id", "gen-1".to_string())));
    }

    #[test]
    fn test_generation_type_from_str() {
        use std::str::FromStr;
        assert_eq!(GenerationType::from_str("rephrase").unwrap(), GenerationType::Rephrase);
        assert!(GenerationType::Expand.is_selection_scoped());
    }
}
