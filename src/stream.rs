//! Text-event-stream decoding of agent actions.
//!
//! Each frame begins with `data: ` followed by a JSON-encoded action; frames
//! are separated by a blank line. A JSON object containing an `error` key
//! anywhere in it is raised as an error and terminates iteration; a `[DONE]`
//! sentinel ends the stream cleanly. Frames that fail to decode as actions
//! are logged and skipped - the agent's output is untrusted and one garbled
//! frame must not kill the session.

use anyhow::{anyhow, Result};
use futures::Stream;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::warn;

use crate::protocol::Action;

/// End-of-stream sentinel used by the transport.
const DONE_SENTINEL: &str = "[DONE]";

/// Decode a text-event stream of actions from any buffered async reader.
pub fn decode_actions<R>(reader: R) -> impl Stream<Item = Result<Action>>
where
    R: AsyncBufRead + Unpin,
{
    let state = DecodeState {
        lines: reader.lines(),
        data: Vec::new(),
        done: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.next_frame().await {
                Ok(Some(frame)) => match decode_frame(&frame) {
                    FrameResult::Action(action) => return Some((Ok(action), state)),
                    FrameResult::Done => {
                        state.done = true;
                        return None;
                    }
                    FrameResult::Error(err) => {
                        state.done = true;
                        return Some((Err(err), state));
                    }
                    FrameResult::Skip => continue,
                },
                Ok(None) => return None,
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }
        }
    })
}

struct DecodeState<R> {
    lines: Lines<R>,
    data: Vec<String>,
    done: bool,
}

impl<R: AsyncBufRead + Unpin> DecodeState<R> {
    /// Read lines until a complete frame (blank-line terminated) or EOF.
    async fn next_frame(&mut self) -> Result<Option<String>> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                // EOF: flush any unterminated trailing frame.
                if self.data.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(std::mem::take(&mut self.data).join("\n")));
            };
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                if !self.data.is_empty() {
                    return Ok(Some(std::mem::take(&mut self.data).join("\n")));
                }
                continue;
            }
            if let Some(payload) = line.strip_prefix("data:") {
                self.data.push(payload.strip_prefix(' ').unwrap_or(payload).to_string());
            }
            // Other SSE fields (event:, id:, comments) are ignored.
        }
    }
}

enum FrameResult {
    Action(Action),
    Done,
    Error(anyhow::Error),
    Skip,
}

fn decode_frame(frame: &str) -> FrameResult {
    if frame.trim() == DONE_SENTINEL {
        return FrameResult::Done;
    }
    let value: Value = match serde_json::from_str(frame) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "skipping undecodable stream frame");
            return FrameResult::Skip;
        }
    };
    if let Some(message) = find_error(&value) {
        return FrameResult::Error(anyhow!("agent stream error: {}", message));
    }
    match serde_json::from_value::<Action>(value) {
        Ok(action) => FrameResult::Action(action),
        Err(err) => {
            warn!(error = %err, "skipping frame that is not an action");
            FrameResult::Skip
        }
    }
}

/// Search a JSON value for an `error` key at any depth.
fn find_error(value: &Value) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(error) = map.get("error") {
                return Some(match error {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                });
            }
            map.values().find_map(find_error)
        }
        Value::Array(items) => items.iter().find_map(find_error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::protocol::ActionKind;

    async fn collect(input: &str) -> Vec<Result<Action>> {
        decode_actions(input.as_bytes()).collect().await
    }

    #[tokio::test]
    async fn decodes_data_frames_separated_by_blank_lines() {
        let input = "data: {\"id\":\"a1\",\"name\":\"think\",\"params\":{\"text\":\"hi\"}}\n\n\
                     data: {\"id\":\"a2\",\"name\":\"think\",\"params\":{\"text\":\"more\"}}\n\n";
        let actions = collect(input).await;
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].as_ref().unwrap().id, "a1");
        assert_eq!(actions[1].as_ref().unwrap().id, "a2");
    }

    #[tokio::test]
    async fn error_object_terminates_iteration_with_an_error() {
        let input = "data: {\"id\":\"a1\",\"name\":\"think\",\"params\":{\"text\":\"ok\"}}\n\n\
                     data: {\"error\":\"model overloaded\"}\n\n\
                     data: {\"id\":\"a2\",\"name\":\"think\",\"params\":{\"text\":\"never\"}}\n\n";
        let results = collect(input).await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(err.to_string().contains("model overloaded"));
    }

    #[tokio::test]
    async fn nested_error_key_is_detected() {
        let input = "data: {\"result\": {\"error\": {\"code\": 500}}}\n\n";
        let results = collect(input).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[tokio::test]
    async fn done_sentinel_ends_the_stream_cleanly() {
        let input = "data: {\"id\":\"a1\",\"name\":\"think\",\"params\":{\"text\":\"hi\"}}\n\n\
                     data: [DONE]\n\n\
                     data: {\"id\":\"a2\",\"name\":\"think\",\"params\":{\"text\":\"late\"}}\n\n";
        let results = collect(input).await;
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn garbled_frames_are_skipped() {
        let input = "data: this is not json\n\n\
                     data: {\"id\":\"a1\",\"name\":\"move\",\"params\":{\"ids\":[\"x\"],\"dx\":1.0}}\n\n";
        let results = collect(input).await;
        assert_eq!(results.len(), 1);
        let action = results[0].as_ref().unwrap();
        assert!(matches!(action.kind, ActionKind::Move(_)));
    }

    #[tokio::test]
    async fn multi_line_data_frames_are_joined() {
        let input = "data: {\"id\":\"a1\",\ndata: \"name\":\"think\",\"params\":{\"text\":\"hi\"}}\n\n";
        let results = collect(input).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }
}
