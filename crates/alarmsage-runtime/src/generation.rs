//! Reading model streams under first-response and idle timeouts.

use std::time::Duration;

use tokio_stream::StreamExt;

use alarmsage_chat::{BoxedStream, ChatModel, ModelRequest, StreamChunk};
use alarmsage_core::{Error, Result, Timeouts};

/// Next chunk of `stream`, or `None` once it ends. `started` selects which
/// limit applies: the first-response limit before any chunk, the idle limit
/// between chunks afterwards.
pub(crate) async fn next_chunk(
    stream: &mut BoxedStream,
    timeouts: &Timeouts,
    started: bool,
) -> Result<Option<StreamChunk>> {
    let (operation, limit): (&str, Duration) = if started {
        ("model stream idle", timeouts.model_idle())
    } else {
        ("model first response", timeouts.model_first_chunk())
    };
    match tokio::time::timeout(limit, stream.next()).await {
        Ok(Some(chunk)) => chunk.map(Some),
        Ok(None) => Ok(None),
        Err(_) => Err(Error::timeout(operation, limit)),
    }
}

/// Concatenated text of a completion that nobody watches stream.
pub(crate) async fn complete(
    model: &dyn ChatModel,
    request: ModelRequest,
    timeouts: &Timeouts,
) -> Result<String> {
    let mut stream = model.stream(request);
    let mut text = String::new();
    let mut started = false;
    while let Some(chunk) = next_chunk(&mut stream, timeouts, started).await? {
        started = true;
        match chunk {
            StreamChunk::Token(t) => text.push_str(&t),
            StreamChunk::ToolCall(_) => {}
            StreamChunk::Done { .. } => break,
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alarmsage_chat::{ChatMessage, Script, ScriptedModel};

    fn quick() -> Timeouts {
        Timeouts {
            model_first_chunk_ms: 50,
            model_idle_ms: 50,
            ..Timeouts::default()
        }
    }

    #[tokio::test]
    async fn test_complete_collects_text() {
        let model = ScriptedModel::new(vec![Script::Text(vec!["a".into(), "b".into()])]);
        let text = complete(&model, ModelRequest::new(vec![ChatMessage::user("q")]), &quick())
            .await
            .unwrap();
        assert_eq!(text, "ab");
    }

    #[tokio::test]
    async fn test_stalled_first_response_times_out() {
        let model = ScriptedModel::new(vec![Script::Stall(Duration::from_secs(5), "late".into())]);
        let err = complete(&model, ModelRequest::new(vec![ChatMessage::user("q")]), &quick())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
