//! Incremental protocol parser for the LLM response stream.
//!
//! A resumable state machine consuming UTF-8 chunks of arbitrary size. Tags
//! may straddle chunk boundaries; a partial `<…` is held back until
//! disambiguated and never emitted as content. The parser is pull-based: it
//! returns the events each chunk produced and executes no side effects itself;
//! the caller decides what to dispatch and when.

mod tags;

use serde_json::Value;

use crate::action::{ActionDescriptor, ActionKind, ActionMode, ActionOrigin};
use crate::error::{SoftError, SoftErrorCode};

use tags::{parse_tag, scan_tag, RawTag, TagScan};

/// One parser output. `Action`, `FeedOverride` and `Metadata` fire exactly at
/// the closing tag; chunk variants stream as text arrives.
#[derive(Debug, PartialEq)]
pub enum ParsedEvent {
    /// Text inside `<thought>`.
    Thought { text: String },
    /// A `<response>` tag opened; `last` is the effective final flag.
    ResponseStart { last: bool },
    /// Text inside `<response>`.
    Response { text: String, last: bool },
    /// A complete, well-formed action descriptor.
    Action(ActionDescriptor),
    /// A `<context_feed>` body overriding the feed's cached value.
    FeedOverride { id: String, body: String },
    /// A `<metadata>` body (JSON, object-ness checked downstream).
    Metadata(Value),
    /// Non-fatal protocol violation.
    Soft(SoftError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum State {
    Outside,
    InThought,
    InResponse,
    /// `accept` is None when the opening tag was invalid; the body is then
    /// consumed and discarded at the closing tag.
    InAction {
        in_thought: bool,
        accept: Option<(ActionKind, ActionMode, Option<String>)>,
    },
    InContextFeed {
        id: Option<String>,
    },
    InMetadata,
}

impl State {
    fn closing_literal(&self) -> Option<&'static str> {
        match self {
            State::InAction { .. } => Some("</action>"),
            State::InContextFeed { .. } => Some("</context_feed>"),
            State::InMetadata => Some("</metadata>"),
            _ => None,
        }
    }

    fn open_tag_name(&self) -> &'static str {
        match self {
            State::Outside => "",
            State::InThought => "thought",
            State::InResponse => "response",
            State::InAction { .. } => "action",
            State::InContextFeed { .. } => "context_feed",
            State::InMetadata => "metadata",
        }
    }
}

/// Resumable stream parser. Feed chunks with [`StreamParser::feed`]; call
/// [`StreamParser::finish`] at end of stream to force-close open state.
pub struct StreamParser {
    state: State,
    /// Held-back tail that may begin a tag (or a partial body closing tag).
    carry: String,
    /// Accumulated body for action / context_feed / metadata states.
    body: String,
    /// Creation counter for action descriptors within this stream.
    action_index: usize,
    /// Set once a `final="true"` response has opened; later finals demote.
    final_seen: bool,
    response_final: bool,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            state: State::Outside,
            carry: String::new(),
            body: String::new(),
            action_index: 0,
            final_seen: false,
            response_final: false,
        }
    }

    /// Whether any `final="true"` response tag has been seen in this stream.
    pub fn final_response_seen(&self) -> bool {
        self.final_seen
    }

    /// Consumes one chunk and returns the events it produced, in order.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        let work = if self.carry.is_empty() {
            chunk.to_string()
        } else {
            let mut w = std::mem::take(&mut self.carry);
            w.push_str(chunk);
            w
        };
        let mut pos = 0;
        while pos < work.len() {
            match self.state.closing_literal() {
                Some(closing) => pos = self.consume_body(&work, pos, closing, &mut events),
                None => pos = self.consume_content(&work, pos, &mut events),
            }
        }
        events
    }

    /// Signals end of stream: unterminated state is reported and force-closed.
    pub fn finish(&mut self) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        if !self.carry.is_empty() {
            events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::MalformedTag,
                format!("stream ended inside a partial tag: {:?}", self.carry),
            )));
            self.carry.clear();
        }
        if self.state != State::Outside {
            events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::UnterminatedTag,
                format!(
                    "stream ended inside <{}>; forcing close",
                    self.state.open_tag_name()
                ),
            )));
            self.body.clear();
            self.state = State::Outside;
        }
        events
    }

    /// Content states: stream text, watch for `<`.
    fn consume_content(&mut self, work: &str, pos: usize, events: &mut Vec<ParsedEvent>) -> usize {
        let rest = &work[pos..];
        let Some(lt) = rest.find('<') else {
            self.emit_text(rest, events);
            return work.len();
        };
        if lt > 0 {
            self.emit_text(&rest[..lt], events);
        }
        match scan_tag(&rest[lt..]) {
            TagScan::Incomplete => {
                self.carry = rest[lt..].to_string();
                work.len()
            }
            TagScan::NotTagStart => {
                self.emit_text("<", events);
                pos + lt + 1
            }
            TagScan::Complete { inner, len } => {
                self.handle_tag(inner, events);
                pos + lt + len
            }
        }
    }

    /// Body states: accumulate raw text until the exact closing literal.
    fn consume_body(
        &mut self,
        work: &str,
        pos: usize,
        closing: &str,
        events: &mut Vec<ParsedEvent>,
    ) -> usize {
        let rest = &work[pos..];
        match rest.find(closing) {
            Some(k) => {
                self.body.push_str(&rest[..k]);
                self.close_body(events);
                pos + k + closing.len()
            }
            None => {
                // Hold back the longest tail that could still become the
                // closing literal in the next chunk.
                let hold = (1..closing.len())
                    .rev()
                    .find(|&p| rest.ends_with(&closing[..p]))
                    .unwrap_or(0);
                self.body.push_str(&rest[..rest.len() - hold]);
                self.carry = rest[rest.len() - hold..].to_string();
                work.len()
            }
        }
    }

    fn emit_text(&mut self, text: &str, events: &mut Vec<ParsedEvent>) {
        if text.is_empty() {
            return;
        }
        match self.state {
            State::InThought => events.push(ParsedEvent::Thought {
                text: text.to_string(),
            }),
            State::InResponse => events.push(ParsedEvent::Response {
                text: text.to_string(),
                last: self.response_final,
            }),
            State::Outside => {
                let preview: String = text.trim().chars().take(80).collect();
                if !preview.is_empty() {
                    events.push(ParsedEvent::Soft(SoftError::new(
                        SoftErrorCode::StrayText,
                        format!("content outside any tag discarded: {preview:?}"),
                    )));
                }
            }
            _ => {}
        }
    }

    fn handle_tag(&mut self, inner: &str, events: &mut Vec<ParsedEvent>) {
        let tag = match parse_tag(inner) {
            Ok(tag) => tag,
            Err(msg) => {
                events.push(ParsedEvent::Soft(SoftError::new(
                    SoftErrorCode::MalformedTag,
                    msg,
                )));
                return;
            }
        };
        match self.state {
            State::Outside => self.tag_outside(tag, events),
            State::InThought => self.tag_in_thought(tag, events),
            State::InResponse => self.tag_in_response(tag, events),
            // Body states never route here; their closing literal is matched raw.
            _ => {}
        }
    }

    fn tag_outside(&mut self, tag: RawTag, events: &mut Vec<ParsedEvent>) {
        match (tag.name.as_str(), tag.closing) {
            ("thought", false) => self.state = State::InThought,
            ("response", false) => self.open_response(&tag, events),
            ("action", false) => self.open_action(&tag, false, events),
            ("context_feed", false) => self.open_context_feed(&tag, events),
            ("metadata", false) => {
                self.body.clear();
                self.state = State::InMetadata;
            }
            (name, true) => events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::MalformedTag,
                format!("unmatched closing tag </{name}>"),
            ))),
            (name, false) => events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::UnknownTag,
                format!("unknown tag <{name}> skipped"),
            ))),
        }
    }

    fn tag_in_thought(&mut self, tag: RawTag, events: &mut Vec<ParsedEvent>) {
        match (tag.name.as_str(), tag.closing) {
            ("thought", true) => self.state = State::Outside,
            ("action", false) => self.open_action(&tag, true, events),
            ("response" | "context_feed" | "metadata" | "thought", false) => {
                events.push(ParsedEvent::Soft(SoftError::new(
                    SoftErrorCode::DisallowedNesting,
                    format!("<{}> is not allowed inside <thought>", tag.name),
                )));
            }
            (name, true) => events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::MalformedTag,
                format!("unmatched closing tag </{name}> inside <thought>"),
            ))),
            (name, false) => events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::UnknownTag,
                format!("unknown tag <{name}> inside <thought> skipped"),
            ))),
        }
    }

    fn tag_in_response(&mut self, tag: RawTag, events: &mut Vec<ParsedEvent>) {
        match (tag.name.as_str(), tag.closing) {
            ("response", true) => {
                if self.response_final {
                    self.final_seen = true;
                }
                self.state = State::Outside;
            }
            (name, false) => events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::DisallowedNesting,
                format!("<{name}> is not allowed inside <response>"),
            ))),
            (name, true) => events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::MalformedTag,
                format!("unmatched closing tag </{name}> inside <response>"),
            ))),
        }
    }

    fn open_response(&mut self, tag: &RawTag, events: &mut Vec<ParsedEvent>) {
        let declared_final = match tag.attr("final") {
            None => true,
            Some("true") => true,
            Some("false") => false,
            Some(other) => {
                events.push(ParsedEvent::Soft(SoftError::new(
                    SoftErrorCode::MalformedTag,
                    format!("response final attribute must be \"true\" or \"false\", got {other:?}"),
                )));
                true
            }
        };
        // First final=true wins; a later one streams as non-final.
        self.response_final = if declared_final && self.final_seen {
            events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::DuplicateFinalResponse,
                "a final response was already declared in this stream",
            )));
            false
        } else {
            declared_final
        };
        self.state = State::InResponse;
        events.push(ParsedEvent::ResponseStart {
            last: self.response_final,
        });
    }

    fn open_action(&mut self, tag: &RawTag, in_thought: bool, events: &mut Vec<ParsedEvent>) {
        let accept = Self::action_attrs(tag).map_err(|msg| {
            events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::MalformedTag,
                msg,
            )));
        });
        self.body.clear();
        self.state = State::InAction {
            in_thought,
            accept: accept.ok(),
        };
    }

    fn action_attrs(tag: &RawTag) -> Result<(ActionKind, ActionMode, Option<String>), String> {
        let kind = match tag.attr("type") {
            Some(t) => {
                ActionKind::parse(t).ok_or_else(|| format!("unknown action type {t:?}"))?
            }
            None => return Err("action tag missing type attribute".to_string()),
        };
        let mode = match tag.attr("mode") {
            Some(m) => {
                ActionMode::parse(m).ok_or_else(|| format!("unknown action mode {m:?}"))?
            }
            None => ActionMode::Sync,
        };
        Ok((kind, mode, tag.attr("id").map(str::to_string)))
    }

    fn open_context_feed(&mut self, tag: &RawTag, events: &mut Vec<ParsedEvent>) {
        let id = tag.attr("id").map(str::to_string);
        if id.is_none() {
            events.push(ParsedEvent::Soft(SoftError::new(
                SoftErrorCode::MalformedTag,
                "context_feed tag missing id attribute",
            )));
        }
        self.body.clear();
        self.state = State::InContextFeed { id };
    }

    /// Closes the current body state, producing its event.
    fn close_body(&mut self, events: &mut Vec<ParsedEvent>) {
        let body = std::mem::take(&mut self.body);
        let state = std::mem::replace(&mut self.state, State::Outside);
        match state {
            State::InAction { in_thought, accept } => {
                self.state = if in_thought {
                    State::InThought
                } else {
                    State::Outside
                };
                let Some((kind, mode, id)) = accept else {
                    return; // invalid open tag already reported
                };
                let origin = if in_thought {
                    ActionOrigin::InThought
                } else {
                    ActionOrigin::TopLevel
                };
                let index = self.action_index;
                self.action_index += 1;
                match ActionDescriptor::from_body(&body, kind, mode, id, origin, index) {
                    Ok(desc) => events.push(ParsedEvent::Action(desc)),
                    Err(e) => events.push(ParsedEvent::Soft(SoftError::new(
                        SoftErrorCode::MalformedActionBody,
                        format!("action body rejected: {e}"),
                    ))),
                }
            }
            State::InContextFeed { id } => {
                if let Some(id) = id {
                    events.push(ParsedEvent::FeedOverride {
                        id,
                        body: body.trim().to_string(),
                    });
                }
            }
            State::InMetadata => match serde_json::from_str::<Value>(&body) {
                Ok(value) => events.push(ParsedEvent::Metadata(value)),
                Err(e) => events.push(ParsedEvent::Soft(SoftError::new(
                    SoftErrorCode::MetadataNotObject,
                    format!("metadata body is not valid JSON: {e}"),
                ))),
            },
            other => {
                // Body close with no body state is unreachable by construction.
                self.state = other;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::OnErrorPolicy;
    use serde_json::json;

    fn feed_all(parser: &mut StreamParser, chunks: &[&str]) -> Vec<ParsedEvent> {
        let mut out = Vec::new();
        for c in chunks {
            out.extend(parser.feed(c));
        }
        out.extend(parser.finish());
        out
    }

    fn soft_codes(events: &[ParsedEvent]) -> Vec<SoftErrorCode> {
        events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Soft(s) => Some(s.code),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn streams_thought_and_response_content() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &["<thought>Plan.</thought><response final=\"true\">ok</response>"],
        );
        assert_eq!(
            events,
            vec![
                ParsedEvent::Thought {
                    text: "Plan.".into()
                },
                ParsedEvent::ResponseStart { last: true },
                ParsedEvent::Response {
                    text: "ok".into(),
                    last: true
                },
            ]
        );
        assert!(p.final_response_seen());
    }

    #[test]
    fn tag_straddles_chunk_boundary() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<thou", "ght>a", "b</thoug", "ht>"]);
        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Thought { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts.concat(), "ab");
        assert!(soft_codes(&events).is_empty());
    }

    #[test]
    fn partial_open_bracket_is_never_emitted_as_content() {
        let mut p = StreamParser::new();
        let events = p.feed("<thought>abc<");
        assert_eq!(
            events,
            vec![ParsedEvent::Thought { text: "abc".into() }]
        );
        let events = p.feed("/thought>");
        assert!(events.is_empty());
    }

    #[test]
    fn literal_angle_bracket_in_content_is_kept() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<response final=\"false\">1 < 2</response>"]);
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Response { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "1 < 2");
    }

    #[test]
    fn action_parses_at_closing_tag() {
        let mut p = StreamParser::new();
        let body = r#"{"name":"fetch","parameters":{"url":"X"},"output_key":"x"}"#;
        let events = feed_all(
            &mut p,
            &[&format!(
                "<action type=\"tool\" mode=\"async\" id=\"a\">{body}</action>"
            )],
        );
        let [ParsedEvent::Action(desc)] = &events[..] else {
            panic!("expected one action event, got {events:?}");
        };
        assert_eq!(desc.id, "a");
        assert_eq!(desc.kind, ActionKind::Tool);
        assert_eq!(desc.mode, ActionMode::Async);
        assert_eq!(desc.name, "fetch");
        assert_eq!(desc.output_key.as_deref(), Some("x"));
        assert_eq!(desc.on_error, OnErrorPolicy::Cancel);
    }

    #[test]
    fn action_inside_thought_emits_between_thought_chunks() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &[concat!(
                "<thought>Planning. ",
                "<action type=\"tool\" mode=\"async\" id=\"p\">{\"name\":\"ping\",\"parameters\":{},\"output_key\":\"r\"}</action>",
                " Continuing.</thought>"
            )],
        );
        assert!(matches!(
            &events[0],
            ParsedEvent::Thought { text } if text == "Planning. "
        ));
        assert!(matches!(&events[1], ParsedEvent::Action(d) if d.id == "p"));
        assert!(matches!(
            &events[2],
            ParsedEvent::Thought { text } if text == " Continuing."
        ));
    }

    #[test]
    fn action_id_generated_when_missing() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &["<action type=\"tool\">{\"name\":\"a\"}</action><action type=\"tool\">{\"name\":\"b\"}</action>"],
        );
        let ids: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Action(d) => Some(d.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["act-0", "act-1"]);
    }

    #[test]
    fn malformed_action_json_is_soft_error() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<action type=\"tool\">{oops}</action>"]);
        assert_eq!(soft_codes(&events), vec![SoftErrorCode::MalformedActionBody]);
    }

    #[test]
    fn unknown_action_type_is_soft_error_and_body_discarded() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &["<action type=\"widget\">{\"name\":\"x\"}</action>"],
        );
        assert_eq!(soft_codes(&events), vec![SoftErrorCode::MalformedTag]);
        assert!(!events.iter().any(|e| matches!(e, ParsedEvent::Action(_))));
    }

    #[test]
    fn context_feed_override_records_body() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<context_feed id=\"news\"> latest </context_feed>"]);
        assert_eq!(
            events,
            vec![ParsedEvent::FeedOverride {
                id: "news".into(),
                body: "latest".into()
            }]
        );
    }

    #[test]
    fn metadata_body_is_parsed_json() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<metadata>{\"status\":\"CODING\"}</metadata>"]);
        assert_eq!(
            events,
            vec![ParsedEvent::Metadata(json!({"status": "CODING"}))]
        );
    }

    #[test]
    fn stray_text_outside_tags_is_reported_and_discarded() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["hello <thought>x</thought>"]);
        assert_eq!(soft_codes(&events), vec![SoftErrorCode::StrayText]);
        assert!(events
            .iter()
            .any(|e| matches!(e, ParsedEvent::Thought { text } if text == "x")));
    }

    #[test]
    fn nested_response_in_thought_is_disallowed() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<thought><response>no</response>x</thought>"]);
        assert!(soft_codes(&events).contains(&SoftErrorCode::DisallowedNesting));
    }

    #[test]
    fn second_final_response_is_demoted() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &["<response final=\"true\">a</response><response final=\"true\">b</response>"],
        );
        assert!(soft_codes(&events).contains(&SoftErrorCode::DuplicateFinalResponse));
        let finals: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                ParsedEvent::Response { last, .. } => Some(*last),
                _ => None,
            })
            .collect();
        assert_eq!(finals, vec![true, false]);
    }

    #[test]
    fn response_final_defaults_to_true() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<response>done</response>"]);
        assert!(matches!(
            events[0],
            ParsedEvent::ResponseStart { last: true }
        ));
    }

    #[test]
    fn unterminated_tag_at_stream_end_is_forced_closed() {
        let mut p = StreamParser::new();
        let mut events = p.feed("<thought>still going");
        events.extend(p.finish());
        assert!(soft_codes(&events).contains(&SoftErrorCode::UnterminatedTag));
        assert!(events
            .iter()
            .any(|e| matches!(e, ParsedEvent::Thought { text } if text == "still going")));
    }

    #[test]
    fn closing_tag_straddles_chunks_inside_action_body() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &[
                "<action type=\"tool\" id=\"a\">{\"name\":\"t\"}</ac",
                "tion>",
            ],
        );
        assert!(matches!(&events[..], [ParsedEvent::Action(d)] if d.id == "a"));
    }

    #[test]
    fn angle_bracket_inside_action_body_is_body_text() {
        let mut p = StreamParser::new();
        let events = feed_all(
            &mut p,
            &["<action type=\"tool\" id=\"a\">{\"name\":\"t\",\"parameters\":{\"cmp\":\"a<b\"}}</action>"],
        );
        let [ParsedEvent::Action(d)] = &events[..] else {
            panic!("expected action, got {events:?}");
        };
        assert_eq!(d.parameters, json!({"cmp": "a<b"}));
    }

    #[test]
    fn whitespace_between_tags_is_ignored() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["  \n <thought>x</thought>\n  "]);
        assert!(soft_codes(&events).is_empty());
    }

    #[test]
    fn unknown_top_level_tag_is_skipped() {
        let mut p = StreamParser::new();
        let events = feed_all(&mut p, &["<banana></banana><thought>y</thought>"]);
        let codes = soft_codes(&events);
        // Open is unknown; the stray close is unmatched.
        assert_eq!(
            codes,
            vec![SoftErrorCode::UnknownTag, SoftErrorCode::MalformedTag]
        );
    }
}
