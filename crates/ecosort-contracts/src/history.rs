use chrono::NaiveDateTime;

use crate::api::{HistoryReply, WireBotResponse, WireConversation, WireImage};

/// Where the server serves uploaded and mirrored images from.
pub const UPLOAD_URL_PREFIX: &str = "/static/uploads/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    UploadedFile,
    ExternalUrl,
    LocalPath,
}

/// A displayable reference to an image that was part of a conversation.
///
/// `display_url` is what gets rendered; for external URLs the server keeps
/// a mirrored copy, so the original address survives only in
/// `original_url`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRef {
    pub kind: ImageKind,
    pub display_url: String,
    pub original_url: Option<String>,
    pub filename: Option<String>,
}

impl ImageRef {
    /// Map a raw history record to a displayable reference.
    ///
    /// Records with an unrecognized `tipo` are dropped, not errors; the
    /// server has grown new kinds before and old clients must keep
    /// rendering the rest of the conversation.
    pub fn from_wire(wire: &WireImage) -> Option<Self> {
        match wire.tipo.as_str() {
            "archivo_subido" => {
                let display_url = wire
                    .url_relativa
                    .clone()
                    .or_else(|| relative_upload_url(wire.filename.as_deref()))?;
                Some(Self {
                    kind: ImageKind::UploadedFile,
                    display_url,
                    original_url: None,
                    filename: wire.filename.clone(),
                })
            }
            "url_externa" => {
                let display_url = wire
                    .url_relativa
                    .clone()
                    .or_else(|| wire.url_original.clone())?;
                Some(Self {
                    kind: ImageKind::ExternalUrl,
                    display_url,
                    original_url: wire.url_original.clone(),
                    filename: wire.filename.clone(),
                })
            }
            "ruta_local" => {
                let display_url = relative_upload_url(wire.filename.as_deref())?;
                Some(Self {
                    kind: ImageKind::LocalPath,
                    display_url,
                    original_url: wire.ruta_original.clone(),
                    filename: wire.filename.clone(),
                })
            }
            _ => None,
        }
    }
}

fn relative_upload_url(filename: Option<&str>) -> Option<String> {
    let filename = filename?;
    if filename.is_empty() {
        return None;
    }
    Some(format!("{UPLOAD_URL_PREFIX}{filename}"))
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub label: String,
    pub confidence: f64,
    pub confidence_display: String,
    pub recommendation: String,
}

impl AnalysisResult {
    pub fn from_wire(wire: &WireBotResponse) -> Self {
        let confidence = wire.resultado.confianza;
        // The server renders the percentage; reuse its string when present
        // so replayed text matches what was originally shown.
        let confidence_display = wire
            .resultado
            .confianza_porcentaje
            .clone()
            .unwrap_or_else(|| format_confidence(confidence));
        Self {
            label: wire.resultado.etiqueta.clone(),
            confidence,
            confidence_display,
            recommendation: wire.recomendacion.clone(),
        }
    }
}

pub fn format_confidence(confidence: f64) -> String {
    format!("{:.1}%", confidence * 100.0)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserMessage {
    pub text: String,
    pub images: Vec<ImageRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub timestamp: String,
    pub user_message: UserMessage,
    pub bot_responses: Vec<AnalysisResult>,
}

impl Conversation {
    pub fn from_wire(wire: &WireConversation) -> Self {
        Self {
            timestamp: wire.timestamp.clone(),
            user_message: UserMessage {
                text: wire.user_message.text.clone(),
                images: wire
                    .user_message
                    .images
                    .iter()
                    .filter_map(ImageRef::from_wire)
                    .collect(),
            },
            bot_responses: wire.bot_responses.iter().map(AnalysisResult::from_wire).collect(),
        }
    }
}

/// Extract the replayable conversations from a history reply, oldest
/// first. The server does not guarantee order, so sort here; the sort is
/// stable and records with unparseable timestamps keep their arrival
/// order at the front.
pub fn conversations_from_reply(reply: &HistoryReply) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = reply
        .conversations
        .iter()
        .map(Conversation::from_wire)
        .collect();
    conversations.sort_by_key(|conv| parse_timestamp(&conv.timestamp));
    conversations
}

fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(with_offset) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(with_offset.naive_utc());
    }
    raw.parse::<NaiveDateTime>().ok()
}

/// Rebuild the answer text the server originally rendered for a set of
/// classification results. Matches the server's template with `<br>`
/// already normalized to newlines; one block per image, 1-based.
pub fn bot_turn_text(responses: &[AnalysisResult]) -> String {
    let blocks: Vec<String> = responses
        .iter()
        .enumerate()
        .map(|(idx, resp)| {
            format!(
                "Imagen {}:\nMaterial identificado: {}\nPorcentaje de confianza: {}\n💡 {}",
                idx + 1,
                resp.label,
                resp.confidence_display,
                resp.recommendation
            )
        })
        .collect();
    blocks.join("\n\n")
}

/// Clean the server's rendered HTML-ish answer for terminal display:
/// `<br>` (any case) becomes a newline, runs of three or more newlines
/// collapse to a blank line, surrounding whitespace is trimmed.
pub fn normalize_bot_text(text: &str) -> String {
    let mut replaced = String::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].len() >= 4 && bytes[i..i + 4].eq_ignore_ascii_case(b"<br>") {
            replaced.push('\n');
            i += 4;
        } else {
            let ch = text[i..].chars().next().unwrap_or('\u{FFFD}');
            replaced.push(ch);
            i += ch.len_utf8();
        }
    }

    let mut collapsed = String::with_capacity(replaced.len());
    let mut newline_run = 0usize;
    for ch in replaced.chars() {
        if ch == '\n' {
            newline_run += 1;
            if newline_run <= 2 {
                collapsed.push(ch);
            }
        } else {
            newline_run = 0;
            collapsed.push(ch);
        }
    }
    collapsed.trim().to_string()
}
