//! Per-session rollups over a merged timeline.

use std::collections::{HashMap, HashSet};

use chrono::TimeDelta;
use serde::Serialize;
use simd_json::OwnedValue;
use simd_json::prelude::*;

use crate::types::{EntryKind, TimelineEntry, TranscriptEntry};
use crate::utils::preview_line;

const PREVIEW_CHARS: usize = 120;
const UNKNOWN_SESSION: &str = "unknown";

/// Default silence after which a new span starts.
pub const DEFAULT_SPAN_GAP: TimeDelta = TimeDelta::seconds(600);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TokenTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenTotals {
    fn add_usage(&mut self, usage: &OwnedValue) {
        let field = |name: &str| usage.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        self.input_tokens += field("input_tokens");
        self.output_tokens += field("output_tokens");
        self.cache_creation_tokens += field("cache_creation_input_tokens");
        self.cache_read_tokens += field("cache_read_input_tokens");
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub message_count: usize,
    pub first_user_message: String,
    pub tokens: TokenTotals,
}

impl SessionInfo {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            summary: None,
            first_timestamp: None,
            last_timestamp: None,
            message_count: 0,
            first_user_message: String::new(),
            tokens: TokenTotals::default(),
        }
    }
}

/// Group `entries` by session, in first-seen order.
///
/// Summaries are attached through their `leafUuid`, which names the last
/// assistant message of the session they describe. Summaries whose leaf is not
/// among `entries` are dropped.
pub fn build_session_index(entries: &[TimelineEntry]) -> Vec<SessionInfo> {
    let records: Vec<&TranscriptEntry> = entries.iter().map(|e| &e.entry).collect();

    let mut assistant_sessions: HashMap<&str, &str> = HashMap::new();
    for entry in &records {
        if entry.kind == EntryKind::Assistant
            && let (Some(uuid), Some(session)) =
                (entry.uuid.as_deref(), entry.session_id.as_deref())
        {
            assistant_sessions.insert(uuid, session);
        }
    }

    let mut summaries: HashMap<&str, &str> = HashMap::new();
    for entry in &records {
        if entry.is_summary()
            && let (Some(leaf), Some(text)) = (entry.leaf_uuid.as_deref(), entry.summary.as_deref())
            && let Some(&session) = assistant_sessions.get(leaf)
        {
            summaries.insert(session, text);
        }
    }

    let mut sessions: Vec<SessionInfo> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut seen_requests: HashSet<&str> = HashSet::new();

    for entry in records.iter().filter(|e| !e.is_summary()) {
        let id = entry.session_id.as_deref().unwrap_or(UNKNOWN_SESSION);
        let pos = *positions.entry(id).or_insert_with(|| {
            let mut info = SessionInfo::new(id);
            info.summary = summaries.get(id).map(|s| s.to_string());
            sessions.push(info);
            sessions.len() - 1
        });
        let session = &mut sessions[pos];

        session.message_count += 1;
        if let Some(ts) = &entry.timestamp {
            if session.first_timestamp.is_none() {
                session.first_timestamp = Some(ts.clone());
            }
            session.last_timestamp = Some(ts.clone());
        }

        match entry.kind {
            EntryKind::User if session.first_user_message.is_empty() => {
                if let Some(text) = entry.message.as_ref().and_then(message_text) {
                    session.first_user_message = preview_line(&text, PREVIEW_CHARS);
                }
            }
            EntryKind::Assistant => {
                let usage = entry.message.as_ref().and_then(|m| m.get("usage"));
                // Streaming writes several lines per request, each repeating the usage.
                if let (Some(usage), Some(request)) = (usage, entry.request_id.as_deref())
                    && seen_requests.insert(request)
                {
                    session.tokens.add_usage(usage);
                }
            }
            _ => {}
        }
    }

    sessions
}

/// What a span was mostly about. Earlier variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    /// Touched the todo list (`TodoWrite`).
    Todo,
    /// Used tools, or carried thinking or images.
    Tooling,
    /// Only system records.
    System,
    Chat,
}

/// A run of consecutive messages from one session without a long pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Span {
    pub id: String,
    pub session_id: Option<String>,
    pub kind: SpanKind,
    pub title: Option<String>,
    /// Positions in the timeline the span was built from, inclusive.
    pub start_index: usize,
    pub end_index: usize,
    pub message_count: usize,
    pub start_timestamp: Option<String>,
    pub end_timestamp: Option<String>,
}

struct SpanBuilder<'a> {
    session_id: Option<&'a str>,
    start_index: usize,
    end_index: usize,
    message_count: usize,
    start_timestamp: Option<&'a str>,
    end_timestamp: Option<&'a str>,
    user_title: Option<String>,
    assistant_title: Option<String>,
    has_todo: bool,
    has_tooling: bool,
    all_system: bool,
}

impl<'a> SpanBuilder<'a> {
    fn start(index: usize, entry: &'a TranscriptEntry) -> Self {
        Self {
            session_id: entry.session_id.as_deref(),
            start_index: index,
            end_index: index,
            message_count: 0,
            start_timestamp: entry.timestamp.as_deref(),
            end_timestamp: entry.timestamp.as_deref(),
            user_title: None,
            assistant_title: None,
            has_todo: false,
            has_tooling: false,
            all_system: true,
        }
    }

    fn push(&mut self, index: usize, entry: &'a TranscriptEntry) {
        self.end_index = index;
        self.message_count += 1;
        self.end_timestamp = entry.timestamp.as_deref();
        if entry.kind != EntryKind::System {
            self.all_system = false;
        }

        let Some(message) = entry.message.as_ref() else {
            return;
        };
        if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
            for block in blocks {
                let block_type = block.get("type").and_then(|t| t.as_str());
                if matches!(
                    block_type,
                    Some("tool_use" | "tool_result" | "thinking" | "image")
                ) {
                    self.has_tooling = true;
                }
                if block_type == Some("tool_use")
                    && block.get("name").and_then(|n| n.as_str()) == Some("TodoWrite")
                {
                    self.has_todo = true;
                }
            }
        }

        let title = match entry.kind {
            EntryKind::User => &mut self.user_title,
            EntryKind::Assistant => &mut self.assistant_title,
            _ => return,
        };
        if title.is_none()
            && let Some(text) = message_text(message)
        {
            *title = Some(preview_line(&text, PREVIEW_CHARS));
        }
    }

    fn finish(self) -> Span {
        let kind = if self.has_todo {
            SpanKind::Todo
        } else if self.has_tooling {
            SpanKind::Tooling
        } else if self.all_system {
            SpanKind::System
        } else {
            SpanKind::Chat
        };
        Span {
            id: format!(
                "{}-{}-{}",
                self.session_id.unwrap_or("span"),
                self.start_index,
                self.end_index
            ),
            session_id: self.session_id.map(str::to_string),
            kind,
            title: self.user_title.or(self.assistant_title),
            start_index: self.start_index,
            end_index: self.end_index,
            message_count: self.message_count,
            start_timestamp: self.start_timestamp.map(str::to_string),
            end_timestamp: self.end_timestamp.map(str::to_string),
        }
    }
}

/// Split a merged timeline into spans.
///
/// A new span starts when the session changes, or when more than `gap`
/// passes between two consecutive messages. Summaries are skipped and never
/// break a span. The title is the first user text of the span, else the
/// first assistant text.
pub fn build_spans(entries: &[TimelineEntry], gap: TimeDelta) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut current: Option<SpanBuilder> = None;
    let mut previous: Option<&TranscriptEntry> = None;

    for (index, timeline_entry) in entries.iter().enumerate() {
        let entry = &timeline_entry.entry;
        if entry.is_summary() {
            continue;
        }

        let boundary = match previous {
            None => true,
            Some(prev) if prev.session_id != entry.session_id => true,
            Some(prev) => match (prev.instant(), entry.instant()) {
                (Some(before), Some(now)) => now - before > gap,
                _ => false,
            },
        };
        if boundary && let Some(span) = current.take() {
            spans.push(span.finish());
        }

        current
            .get_or_insert_with(|| SpanBuilder::start(index, entry))
            .push(index, entry);
        previous = Some(entry);
    }

    if let Some(span) = current {
        spans.push(span.finish());
    }
    spans
}

/// Plain text of a message's `content`: either a string, or the concatenated
/// `text` blocks of a content array. `None` when there is no text.
fn message_text(message: &OwnedValue) -> Option<String> {
    let content = message.get("content")?;
    if let Some(text) = content.as_str() {
        return (!text.trim().is_empty()).then(|| text.to_string());
    }

    let blocks = content.as_array()?;
    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    let joined = text.join("\n");
    (!joined.trim().is_empty()).then_some(joined)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{RecordCodec, TranscriptCodec};
    use std::path::Path;
    use std::sync::Arc;

    fn timeline(lines: &[&str]) -> Vec<TimelineEntry> {
        let source: Arc<Path> = Arc::from(Path::new("/p/a.jsonl"));
        lines
            .iter()
            .map(|line| {
                let entry = TranscriptCodec.decode_line(line).unwrap();
                TimelineEntry {
                    sort_at: entry.instant(),
                    entry,
                    source: Arc::clone(&source),
                }
            })
            .collect()
    }

    const USER_S1: &str = r#"{"type":"user","timestamp":"2024-01-01T10:00:00Z","sessionId":"s1","uuid":"u1","message":{"role":"user","content":"Fix the build\nplease"}}"#;
    const ASSISTANT_S1_A: &str = r#"{"type":"assistant","timestamp":"2024-01-01T10:00:05Z","sessionId":"s1","uuid":"a1","requestId":"r1","message":{"role":"assistant","content":[{"type":"text","text":"ok"}],"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":100}}}"#;
    const ASSISTANT_S1_B: &str = r#"{"type":"assistant","timestamp":"2024-01-01T10:00:06Z","sessionId":"s1","uuid":"a2","requestId":"r1","message":{"role":"assistant","content":[{"type":"text","text":"done"}],"usage":{"input_tokens":10,"output_tokens":5,"cache_read_input_tokens":100}}}"#;
    const USER_S2: &str = r#"{"type":"user","timestamp":"2024-01-02T09:00:00Z","sessionId":"s2","uuid":"u2","message":{"role":"user","content":[{"type":"text","text":"Second session"}]}}"#;
    const SUMMARY_S1: &str = r#"{"type":"summary","summary":"Build fix","leafUuid":"a2"}"#;
    const SUMMARY_ORPHAN: &str = r#"{"type":"summary","summary":"Lost","leafUuid":"missing"}"#;

    #[test]
    fn test_sessions_in_first_seen_order() {
        let sessions = build_session_index(&timeline(&[USER_S1, USER_S2, ASSISTANT_S1_A]));
        let ids: Vec<&str> = sessions.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let s1 = &sessions[0];
        assert_eq!(s1.message_count, 2);
        assert_eq!(s1.first_timestamp.as_deref(), Some("2024-01-01T10:00:00Z"));
        assert_eq!(s1.last_timestamp.as_deref(), Some("2024-01-01T10:00:05Z"));
        assert_eq!(s1.first_user_message, "Fix the build");
        assert_eq!(sessions[1].first_user_message, "Second session");
    }

    #[test]
    fn test_tokens_counted_once_per_request() {
        let sessions = build_session_index(&timeline(&[USER_S1, ASSISTANT_S1_A, ASSISTANT_S1_B]));
        let tokens = &sessions[0].tokens;
        assert_eq!(tokens.input_tokens, 10);
        assert_eq!(tokens.output_tokens, 5);
        assert_eq!(tokens.cache_read_tokens, 100);
        assert_eq!(tokens.cache_creation_tokens, 0);
        assert_eq!(tokens.total(), 115);
    }

    #[test]
    fn test_summary_attached_via_leaf_uuid() {
        let sessions = build_session_index(&timeline(&[
            SUMMARY_S1,
            SUMMARY_ORPHAN,
            USER_S1,
            ASSISTANT_S1_B,
            USER_S2,
        ]));
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].summary.as_deref(), Some("Build fix"));
        assert_eq!(sessions[1].summary, None);
        // Summaries are not messages.
        assert_eq!(sessions[0].message_count, 2);
    }

    #[test]
    fn test_empty_timeline() {
        assert!(build_session_index(&[]).is_empty());
        assert!(build_spans(&[], DEFAULT_SPAN_GAP).is_empty());
    }

    fn chat(ts: &str, session: &str, kind: &str, text: &str) -> String {
        format!(
            r#"{{"type":"{kind}","timestamp":"{ts}","sessionId":"{session}","message":{{"role":"{kind}","content":"{text}"}}}}"#
        )
    }

    fn spans_of(lines: &[String]) -> Vec<Span> {
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        build_spans(&timeline(&lines), DEFAULT_SPAN_GAP)
    }

    #[test]
    fn test_spans_break_on_session_change() {
        let spans = spans_of(&[
            chat("2024-01-01T10:00:00Z", "s1", "user", "first"),
            chat("2024-01-01T10:00:10Z", "s1", "assistant", "reply"),
            chat("2024-01-01T10:00:20Z", "s2", "user", "other session"),
        ]);
        assert_eq!(spans.len(), 2);

        assert_eq!(spans[0].session_id.as_deref(), Some("s1"));
        assert_eq!((spans[0].start_index, spans[0].end_index), (0, 1));
        assert_eq!(spans[0].message_count, 2);
        assert_eq!(spans[0].title.as_deref(), Some("first"));
        assert_eq!(spans[0].id, "s1-0-1");
        assert_eq!(spans[0].start_timestamp.as_deref(), Some("2024-01-01T10:00:00Z"));
        assert_eq!(spans[0].end_timestamp.as_deref(), Some("2024-01-01T10:00:10Z"));

        assert_eq!(spans[1].session_id.as_deref(), Some("s2"));
        assert_eq!((spans[1].start_index, spans[1].end_index), (2, 2));
    }

    #[test]
    fn test_spans_break_only_past_the_gap() {
        // Exactly ten minutes apart stays together.
        let spans = spans_of(&[
            chat("2024-01-01T10:00:00Z", "s1", "user", "a"),
            chat("2024-01-01T10:10:00Z", "s1", "user", "b"),
        ]);
        assert_eq!(spans.len(), 1);

        let spans = spans_of(&[
            chat("2024-01-01T10:00:00Z", "s1", "user", "a"),
            chat("2024-01-01T10:10:01Z", "s1", "user", "b"),
        ]);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].title.as_deref(), Some("b"));

        let lines = [
            chat("2024-01-01T10:00:00Z", "s1", "user", "a"),
            chat("2024-01-01T10:00:30Z", "s1", "user", "b"),
        ];
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        let spans = build_spans(&timeline(&lines), TimeDelta::seconds(10));
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn test_summaries_do_not_split_spans() {
        let user = chat("2024-01-01T10:00:00Z", "s1", "user", "a");
        let reply = chat("2024-01-01T10:00:05Z", "s1", "assistant", "b");
        let spans = build_spans(
            &timeline(&[user.as_str(), SUMMARY_S1, reply.as_str()]),
            DEFAULT_SPAN_GAP,
        );
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start_index, spans[0].end_index), (0, 2));
        assert_eq!(spans[0].message_count, 2);
    }

    #[test]
    fn test_span_kind_precedence() {
        let tool_use = r#"{"type":"assistant","timestamp":"2024-01-01T10:00:01Z","sessionId":"s1","message":{"role":"assistant","content":[{"type":"tool_use","name":"Bash","input":{}}]}}"#;
        let todo = r#"{"type":"assistant","timestamp":"2024-01-01T10:00:02Z","sessionId":"s1","message":{"role":"assistant","content":[{"type":"tool_use","name":"TodoWrite","input":{}}]}}"#;
        let system = r#"{"type":"system","timestamp":"2024-01-01T11:00:00Z","sessionId":"s1","content":"Compacted"}"#;
        let user = chat("2024-01-01T10:00:00Z", "s1", "user", "go");
        let late_user = chat("2024-01-01T12:00:00Z", "s1", "user", "plain");

        let spans = build_spans(
            &timeline(&[user.as_str(), tool_use, todo, system, late_user.as_str()]),
            DEFAULT_SPAN_GAP,
        );
        let kinds: Vec<SpanKind> = spans.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SpanKind::Todo, SpanKind::System, SpanKind::Chat]);

        let spans = build_spans(&timeline(&[user.as_str(), tool_use]), DEFAULT_SPAN_GAP);
        assert_eq!(spans[0].kind, SpanKind::Tooling);
    }

    #[test]
    fn test_span_title_falls_back_to_assistant_text() {
        let spans = build_spans(&timeline(&[ASSISTANT_S1_A, ASSISTANT_S1_B]), DEFAULT_SPAN_GAP);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].title.as_deref(), Some("ok"));

        let spans = build_spans(&timeline(&[ASSISTANT_S1_A, USER_S1]), DEFAULT_SPAN_GAP);
        assert_eq!(spans[0].title.as_deref(), Some("Fix the build"));
    }
}
