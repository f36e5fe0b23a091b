use serde_json::Value;

/// Restores the client-visible model name in upstream responses and applies
/// the thinking-block compatibility fix.
#[derive(Debug, Clone)]
pub struct ResponseRewriter {
    original_model: String,
}

impl ResponseRewriter {
    pub fn new(original_model: impl Into<String>) -> Self {
        Self {
            original_model: original_model.into(),
        }
    }

    /// Rewrite every known model field in place. Returns whether anything
    /// changed.
    pub fn rewrite_value(&self, value: &mut Value) -> bool {
        let mut changed = false;
        changed |= self.set_model(value, &["message", "model"]);
        changed |= self.set_model(value, &["model"]);
        changed |= self.set_model(value, &["modelVersion"]);
        changed |= self.set_model(value, &["response", "model"]);
        changed |= self.set_model(value, &["response", "modelVersion"]);
        changed |= suppress_thinking_blocks(value);
        changed
    }

    fn set_model(&self, value: &mut Value, path: &[&str]) -> bool {
        let mut current = value;
        for (i, segment) in path.iter().enumerate() {
            let Some(next) = current.get_mut(*segment) else {
                return false;
            };
            if i == path.len() - 1 {
                if next.is_string() && next.as_str() != Some(self.original_model.as_str()) {
                    *next = Value::String(self.original_model.clone());
                    return true;
                }
                return false;
            }
            current = next;
        }
        false
    }

    /// Rewrite a full JSON body; `None` when the body is not JSON or nothing
    /// changed.
    pub fn rewrite_body(&self, body: &[u8]) -> Option<Vec<u8>> {
        let mut value: Value = serde_json::from_slice(body).ok()?;
        if !self.rewrite_value(&mut value) {
            return None;
        }
        serde_json::to_vec(&value).ok()
    }

    /// Rewrite one SSE line in place when it carries a JSON data payload.
    pub fn rewrite_sse_line(&self, line: &str) -> Option<String> {
        let rest = line.strip_prefix("data:")?;
        let payload = rest.trim_start();
        let mut value: Value = serde_json::from_str(payload).ok()?;
        if !self.rewrite_value(&mut value) {
            return None;
        }
        Some(format!("data: {}", serde_json::to_string(&value).ok()?))
    }
}

/// Drop `thinking` content blocks when the same response carries a
/// `tool_use` block. Some clients refuse mixed thinking/tool responses.
pub fn suppress_thinking_blocks(value: &mut Value) -> bool {
    let Some(content) = value.get_mut("content").and_then(Value::as_array_mut) else {
        return false;
    };
    let has_tool_use = content
        .iter()
        .any(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"));
    if !has_tool_use {
        return false;
    }
    let before = content.len();
    content.retain(|block| block.get("type").and_then(Value::as_str) != Some("thinking"));
    before != content.len()
}

/// Stateful line-oriented rewriter for streaming bodies. Chunks may split
/// SSE lines anywhere, including in the middle of a multi-byte UTF-8
/// sequence, so the buffer holds raw bytes and only complete lines are ever
/// decoded; the trailing partial line waits for the next chunk.
#[derive(Debug)]
pub struct SseRewriter {
    rewriter: ResponseRewriter,
    buffer: Vec<u8>,
}

impl SseRewriter {
    pub fn new(original_model: impl Into<String>) -> Self {
        Self {
            rewriter: ResponseRewriter::new(original_model),
            buffer: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            out.extend_from_slice(&self.rewrite_line(&line));
        }
        out
    }

    /// `line` includes its terminator and is forwarded verbatim unless it is
    /// valid UTF-8 carrying a rewritable `data:` payload.
    fn rewrite_line(&self, line: &[u8]) -> Vec<u8> {
        let Ok(text) = std::str::from_utf8(line) else {
            return line.to_vec();
        };
        let trimmed = text.trim_end_matches(['\n', '\r']);
        match self.rewriter.rewrite_sse_line(trimmed) {
            Some(rewritten) => {
                let mut out = rewritten.into_bytes();
                out.extend_from_slice(&line[trimmed.len()..]);
                out
            }
            None => line.to_vec(),
        }
    }

    /// Whatever is still buffered when the stream ends.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}
