//! Invocation controller
//!
//! Drives one conversation to completion:
//!
//! ```text
//! INVOKE → STREAM → DONE
//!            └→ TOOL → append tool_result → INVOKE
//! ```
//!
//! Throttled invocations are retried with exponential backoff. Every wait
//! (invocation, stream receive, backoff sleep) races the cancellation token.

use rand::Rng;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::client::{EventReceiver, ModelTransport};
use crate::editor::FileEditor;
use crate::error::BodsError;
use crate::messages::{ContentBlock, InferenceParameters, Message, Role};
use crate::models::ModelId;
use crate::render::Renderer;
use crate::stream::{DisplayDelta, Signal, StreamDecoder};

pub const MAX_RETRIES: u32 = 6;
const BACKOFF_BASE: Duration = Duration::from_secs(2);
const MAX_JITTER_MS: u64 = 1000;

// ═══════════════════════════════════════════════════════════════
// BACKOFF
// ═══════════════════════════════════════════════════════════════

/// `base × 2^attempt + jitter`, jitter uniform in `[0, max_jitter)`
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max_retries: u32,
    pub max_jitter_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: BACKOFF_BASE,
            max_retries: MAX_RETRIES,
            max_jitter_ms: MAX_JITTER_MS,
        }
    }
}

impl Backoff {
    pub fn delay(&self, attempt: u32, jitter: Duration) -> Duration {
        self.base * 2u32.pow(attempt) + jitter
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..self.max_jitter_ms))
    }
}

// ═══════════════════════════════════════════════════════════════
// CONTROLLER
// ═══════════════════════════════════════════════════════════════

pub struct Controller<'a, T: ModelTransport> {
    transport: &'a T,
    model: ModelId,
    params: InferenceParameters,
    format: bool,
    editor: FileEditor,
    backoff: Backoff,
    cancel: CancellationToken,
    tag: Option<String>,
    tag_dir: PathBuf,
}

impl<'a, T: ModelTransport> Controller<'a, T> {
    pub fn new(transport: &'a T, model: ModelId, params: InferenceParameters) -> Self {
        Self {
            transport,
            model,
            params,
            format: true,
            editor: FileEditor::new(),
            backoff: Backoff::default(),
            cancel: CancellationToken::new(),
            tag: None,
            tag_dir: PathBuf::from("."),
        }
    }

    /// Emit thinking markers around reasoning output
    pub fn with_format(mut self, format: bool) -> Self {
        self.format = format;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Write the first `<tag>…</tag>` of the response to `<dir>/<tag>.txt`
    pub fn with_tag_extraction(mut self, tag: Option<String>, dir: impl Into<PathBuf>) -> Self {
        self.tag = tag.filter(|t| !t.is_empty());
        self.tag_dir = dir.into();
        self
    }

    pub fn editor(&self) -> &FileEditor {
        &self.editor
    }

    /// Serialized request body for the current conversation
    pub fn request_body(&self, conversation: &[Message]) -> Result<Vec<u8>, BodsError> {
        serde_json::to_vec(&self.params.body(conversation))
            .map_err(|e| BodsError::Config(format!("failed to serialize request: {}", e)))
    }

    /// Run until the model finishes without asking for a tool.
    ///
    /// Returns the accumulated response text. On failure the conversation is
    /// left as it was before the failed stream.
    pub async fn run(&mut self, conversation: &mut Vec<Message>, renderer: &mut dyn Renderer) -> Result<String, BodsError> {
        let mut output = String::new();
        let mut round = 0;

        loop {
            round += 1;
            let body = self.request_body(conversation)?;
            tracing::debug!(round, bytes = body.len(), model = %self.model, "INVOKE");
            let mut events = self.invoke_with_retry(body).await?;

            let baseline = conversation.len();
            let mut decoder = StreamDecoder::new(self.format, self.params.thinking.is_some());
            let signal = match self
                .consume(&mut events, &mut decoder, conversation, renderer, &mut output)
                .await
            {
                Ok(signal) => signal,
                Err(e) => {
                    conversation.truncate(baseline);
                    return Err(e);
                }
            };
            drop(events);

            match signal {
                Signal::Completed => {
                    tracing::debug!(round, stop_reason = ?decoder.stop_reason(), "DONE");
                    break;
                }
                Signal::ToolRequested => {
                    tracing::debug!(round, "TOOL");
                    self.answer_tool_call(conversation)?;
                }
            }
        }

        renderer
            .finish()
            .map_err(|e| BodsError::Output(format!("failed to write response: {}", e)))?;

        if let Some(tag) = &self.tag {
            let path = write_tag_file(&self.tag_dir, tag, &output)?;
            tracing::info!("wrote <{}> content to {}", tag, path.display());
        }
        Ok(output)
    }

    async fn invoke_with_retry(&self, body: Vec<u8>) -> Result<EventReceiver, BodsError> {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BodsError::Cancelled),
                result = self.transport.invoke(&self.model, body.clone()) => result,
            };

            match result {
                Ok(events) => return Ok(events),
                Err(e) if e.is_retryable() && attempt < self.backoff.max_retries => {
                    let delay = self.backoff.delay(attempt, self.backoff.jitter());
                    attempt += 1;
                    tracing::warn!("throttled ({}), retry {} in {:?}", e, attempt, delay);
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return Err(BodsError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn consume(
        &self,
        events: &mut EventReceiver,
        decoder: &mut StreamDecoder,
        conversation: &mut Vec<Message>,
        renderer: &mut dyn Renderer,
        output: &mut String,
    ) -> Result<Signal, BodsError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(BodsError::Cancelled),
                next = events.recv() => next,
            };
            let event = next.ok_or_else(|| BodsError::protocol("stream ended before message_stop"))??;

            let step = decoder.apply(conversation, event)?;
            if let Some(delta) = &step.display {
                if let DisplayDelta::Text(text) = delta {
                    output.push_str(text);
                }
                renderer
                    .delta(delta)
                    .map_err(|e| BodsError::Output(format!("failed to write response: {}", e)))?;
            }
            if let Some(signal) = step.signal {
                return Ok(signal);
            }
        }
    }

    /// Run every requested edit and append one `tool_result` per call, in order
    fn answer_tool_call(&mut self, conversation: &mut Vec<Message>) -> Result<(), BodsError> {
        merge_prefill(conversation);
        let calls: Vec<(String, Value)> = conversation
            .last()
            .filter(|m| m.role == Role::Assistant)
            .map(|m| {
                m.content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::ToolUse { id, input, .. } => Some((id.clone(), input.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if calls.is_empty() {
            return Err(BodsError::protocol("tool_use stop without a tool_use block"));
        }

        let mut results = Vec::with_capacity(calls.len());
        for (id, input) in calls {
            let (content, is_error) = self.editor.handle(&input);
            if is_error {
                tracing::warn!("tool call {} failed: {}", id, content);
            }
            results.push(ContentBlock::tool_result(id, content, is_error));
        }
        conversation.push(Message::user(results));
        Ok(())
    }
}

/// An assistant prefill followed by the response is sent back as one turn
fn merge_prefill(conversation: &mut Vec<Message>) {
    let n = conversation.len();
    if n < 2 || conversation[n - 2].role != Role::Assistant || conversation[n - 1].role != Role::Assistant {
        return;
    }
    if let Some(response) = conversation.pop() {
        if let Some(prefill) = conversation.last_mut() {
            prefill.content.extend(response.content);
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// TAG EXTRACTION
// ═══════════════════════════════════════════════════════════════

/// Content of the first `<tag>…</tag>` in `text`
pub fn extract_tag<'t>(text: &'t str, tag: &str) -> Option<&'t str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = text.find(&open)? + open.len();
    let len = text[start..].find(&close)?;
    Some(&text[start..start + len])
}

/// Always writes the file; a missing tag yields an empty one
pub fn write_tag_file(dir: &Path, tag: &str, text: &str) -> Result<PathBuf, BodsError> {
    let content = extract_tag(text, tag).unwrap_or_else(|| {
        tracing::warn!("no <{}> tag in the response", tag);
        ""
    });
    let path = dir.join(format!("{}.txt", tag));
    std::fs::write(&path, content)
        .map_err(|e| BodsError::Output(format!("failed to write {}: {}", path.display(), e)))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EventReceiver;
    use crate::stream::tests::{event, text_stream, tool_stream};
    use crate::stream::StreamEvent;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    enum Reply {
        Events(Vec<StreamEvent>),
        /// Send these, then keep the stream open
        Hang(Vec<StreamEvent>),
        Fail(BodsError),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        bodies: Mutex<Vec<serde_json::Value>>,
        open: Mutex<Vec<mpsc::Sender<Result<StreamEvent, BodsError>>>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.bodies.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ModelTransport for ScriptedTransport {
        async fn invoke(&self, _model: &ModelId, body: Vec<u8>) -> Result<EventReceiver, BodsError> {
            self.bodies.lock().unwrap().push(serde_json::from_slice(&body).unwrap());
            let reply = self.replies.lock().unwrap().pop_front().expect("unscripted invocation");
            let (events, hang) = match reply {
                Reply::Fail(e) => return Err(e),
                Reply::Events(events) => (events, false),
                Reply::Hang(events) => (events, true),
            };
            let (tx, rx) = mpsc::channel(events.len() + 1);
            for e in events {
                tx.try_send(Ok(e)).unwrap();
            }
            if hang {
                self.open.lock().unwrap().push(tx);
            }
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct Recorder {
        deltas: Vec<DisplayDelta>,
        finished: bool,
        cancel_on_first: Option<CancellationToken>,
    }

    impl Renderer for Recorder {
        fn delta(&mut self, delta: &DisplayDelta) -> std::io::Result<()> {
            self.deltas.push(delta.clone());
            if let Some(token) = &self.cancel_on_first {
                token.cancel();
            }
            Ok(())
        }

        fn finish(&mut self) -> std::io::Result<()> {
            self.finished = true;
            Ok(())
        }
    }

    fn throttled() -> BodsError {
        BodsError::transport("API error 429 Too Many Requests: ThrottlingException")
    }

    fn user(text: &str) -> Vec<Message> {
        vec![Message::user(vec![ContentBlock::text(text)])]
    }

    #[tokio::test]
    async fn test_text_response_completes() {
        let transport = ScriptedTransport::new(vec![Reply::Events(text_stream(&["hi", " there"]))]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let mut conversation = user("hello");
        let mut recorder = Recorder::default();

        let output = controller.run(&mut conversation, &mut recorder).await.unwrap();

        assert_eq!(output, "hi there");
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation[1].role, Role::Assistant);
        assert_eq!(conversation[1].text(), "hi there");
        assert!(recorder.finished);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, "x").unwrap();
        let input = json!({"command": "str_replace", "path": path, "old_str": "x", "new_str": "y"});

        let transport = ScriptedTransport::new(vec![
            Reply::Events(tool_stream("toolu_1", &input)),
            Reply::Events(text_stream(&["Done."])),
        ]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let mut conversation = user("edit it");
        controller.run(&mut conversation, &mut Recorder::default()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "y");
        assert_eq!(transport.calls(), 2);

        let second = &transport.bodies.lock().unwrap()[1];
        let messages = second["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        let tool_use = messages[1]["content"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(tool_use["type"], "tool_use");
        assert_eq!(tool_use["id"], "toolu_1");
        assert_eq!(tool_use["input"], input);
        let result = &messages[2]["content"][0];
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(result["type"], "tool_result");
        assert_eq!(result["tool_use_id"], "toolu_1");
        assert!(result["content"]
            .as_str()
            .unwrap()
            .starts_with(&format!("The file {} has been edited.", path.display())));
        assert!(result.get("is_error").is_none());

        assert_eq!(conversation.len(), 4);
        assert_eq!(conversation[3].text(), "Done.");
        assert_eq!(controller.editor().history_len(&path), 1);
    }

    #[tokio::test]
    async fn test_failed_tool_call_is_reported_to_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a");
        std::fs::write(&path, "foo foo").unwrap();
        let input = json!({"command": "str_replace", "path": path, "old_str": "foo", "new_str": "bar"});

        let transport = ScriptedTransport::new(vec![
            Reply::Events(tool_stream("toolu_9", &input)),
            Reply::Events(text_stream(&["Sorry."])),
        ]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let mut conversation = user("edit");
        controller.run(&mut conversation, &mut Recorder::default()).await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "foo foo");
        match &conversation[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, is_error, content } => {
                assert_eq!(tool_use_id, "toolu_9");
                assert!(*is_error);
                assert!(content.contains("in lines [1, 1]"), "{content}");
            }
            other => panic!("expected tool_result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_every_tool_use_block_gets_a_result() {
        let dir = TempDir::new().unwrap();
        let x = dir.path().join("x");
        let y = dir.path().join("y");
        std::fs::write(&x, "first").unwrap();
        std::fs::write(&y, "second").unwrap();

        let mut events = vec![event(json!({"type": "message_start", "message": {"role": "assistant"}}))];
        for (index, (id, path)) in [("a", &x), ("b", &y)].into_iter().enumerate() {
            let raw = json!({"command": "view", "path": path}).to_string();
            events.extend([
                event(json!({
                    "type": "content_block_start", "index": index,
                    "content_block": {"type": "tool_use", "id": id, "name": "str_replace_editor"}
                })),
                event(json!({"type": "content_block_delta", "index": index, "delta": {"type": "input_json_delta", "partial_json": raw}})),
                event(json!({"type": "content_block_stop", "index": index})),
            ]);
        }
        events.extend([
            event(json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}})),
            event(json!({"type": "message_stop"})),
        ]);

        let transport = ScriptedTransport::new(vec![Reply::Events(events), Reply::Events(text_stream(&["Seen."]))]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let mut conversation = user("look at both");
        controller.run(&mut conversation, &mut Recorder::default()).await.unwrap();

        let second = &transport.bodies.lock().unwrap()[1];
        let messages = second["messages"].as_array().unwrap();
        let calls = messages[1]["content"].as_array().unwrap();
        assert_eq!(calls[0]["input"]["path"], json!(x));
        assert_eq!(calls[1]["input"]["path"], json!(y));

        let results = messages[2]["content"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["tool_use_id"], "a");
        assert_eq!(results[1]["tool_use_id"], "b");
        assert!(results[0]["content"].as_str().unwrap().contains("first"));
        assert!(results[1]["content"].as_str().unwrap().contains("second"));
        assert!(results.iter().all(|r| r.get("is_error").is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_bounds() {
        for k in 1..=MAX_RETRIES {
            let mut replies: Vec<Reply> = (0..k).map(|_| Reply::Fail(throttled())).collect();
            replies.push(Reply::Events(text_stream(&["ok"])));
            let transport = ScriptedTransport::new(replies);
            let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());

            let started = tokio::time::Instant::now();
            controller.run(&mut user("hi"), &mut Recorder::default()).await.unwrap();
            let waited = started.elapsed();

            let floor = Duration::from_secs(2 * (2u64.pow(k) - 1));
            assert!(waited >= floor, "k={k}: {waited:?} < {floor:?}");
            assert!(waited <= floor + Duration::from_secs(k as u64), "k={k}: {waited:?}");
            assert_eq!(transport.calls(), k as usize + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttling_gives_up_after_six_retries() {
        let replies = (0..=MAX_RETRIES).map(|_| Reply::Fail(throttled())).collect();
        let transport = ScriptedTransport::new(replies);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());

        let err = controller.run(&mut user("hi"), &mut Recorder::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.calls(), 7);
    }

    #[tokio::test]
    async fn test_other_transport_errors_are_terminal() {
        let transport = ScriptedTransport::new(vec![Reply::Fail(BodsError::transport(
            "API error 403 Forbidden: AccessDeniedException",
        ))]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let err = controller.run(&mut user("hi"), &mut Recorder::default()).await.unwrap_err();
        assert!(matches!(err, BodsError::Transport { throttled: false, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_discards_partial_message() {
        let token = CancellationToken::new();
        let partial = vec![
            event(json!({"type": "message_start", "message": {"role": "assistant"}})),
            event(json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}})),
            event(json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "par"}})),
        ];
        let transport = ScriptedTransport::new(vec![Reply::Hang(partial)]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default())
            .with_cancellation(token.clone());
        let mut conversation = user("hi");
        let mut recorder = Recorder {
            cancel_on_first: Some(token),
            ..Default::default()
        };

        let err = controller.run(&mut conversation, &mut recorder).await.unwrap_err();
        assert!(matches!(err, BodsError::Cancelled));
        assert_eq!(conversation.len(), 1);
        assert_eq!(recorder.deltas, vec![DisplayDelta::Text("par".to_string())]);
        assert!(!recorder.finished);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_protocol_error() {
        let mut events = text_stream(&["hi"]);
        events.pop();
        let transport = ScriptedTransport::new(vec![Reply::Events(events)]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let mut conversation = user("hi");
        let err = controller.run(&mut conversation, &mut Recorder::default()).await.unwrap_err();
        assert!(matches!(err, BodsError::StreamProtocol(_)));
        assert_eq!(conversation.len(), 1);
    }

    #[tokio::test]
    async fn test_prefill_merged_before_tool_result() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("new.txt");
        let input = json!({"command": "create", "path": path, "file_text": "hello"});
        let transport = ScriptedTransport::new(vec![
            Reply::Events(tool_stream("toolu_2", &input)),
            Reply::Events(text_stream(&["ok"])),
        ]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default());
        let mut conversation = user("make a file");
        conversation.push(Message::assistant(vec![ContentBlock::text("Sure.")]));

        controller.run(&mut conversation, &mut Recorder::default()).await.unwrap();

        let roles: Vec<Role> = conversation.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(conversation[1].content[0].as_text(), Some("Sure."));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_tag_extraction_writes_file() {
        let dir = TempDir::new().unwrap();
        let transport = ScriptedTransport::new(vec![Reply::Events(text_stream(&[
            "intro <answer>forty",
            "-two</answer> <answer>no</answer>",
        ]))]);
        let mut controller = Controller::new(&transport, ModelId::default(), InferenceParameters::default())
            .with_tag_extraction(Some("answer".to_string()), dir.path());
        controller.run(&mut user("q"), &mut Recorder::default()).await.unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("answer.txt")).unwrap(), "forty-two");
    }

    #[test]
    fn test_extract_tag() {
        assert_eq!(extract_tag("a <x>b</x> <x>c</x>", "x"), Some("b"));
        assert_eq!(extract_tag("<x>open", "x"), None);
        assert_eq!(extract_tag("none", "x"), None);
    }

    #[test]
    fn test_backoff_delay() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0, Duration::ZERO), Duration::from_secs(2));
        assert_eq!(backoff.delay(5, Duration::from_millis(999)), Duration::from_millis(64_999));
        for _ in 0..100 {
            assert!(backoff.jitter() < Duration::from_secs(1));
        }
    }
}
