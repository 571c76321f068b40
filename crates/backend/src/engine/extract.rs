//! JSON extraction from mixed console output.
//!
//! Engine scripts print progress text, warnings and banners around the JSON
//! they are asked to produce. The scanner below walks the text counting brace
//! depth (ignoring braces inside string literals) and keeps every balanced
//! `{...}` span that parses as a JSON object. Spans that balance but do not
//! parse, like `{progress}`, are skipped and scanning resumes after their
//! opening brace.

use serde_json::Value;

/// Return the last JSON object embedded in `text`, if any.
///
/// The last object wins because scripts print their result at the end, after
/// any diagnostic output that may itself look like JSON.
pub fn extract_json(text: &str) -> Option<Value> {
  find_objects(text).pop()
}

/// All top-level JSON objects embedded in `text`, in order of appearance.
pub fn find_objects(text: &str) -> Vec<Value> {
  let bytes = text.as_bytes();
  let mut found = Vec::new();
  let mut start = 0;

  while let Some(offset) = bytes[start..].iter().position(|&b| b == b'{') {
    let open = start + offset;
    match balanced_end(bytes, open) {
      Some(close) => match serde_json::from_str::<Value>(&text[open..=close]) {
        Ok(value @ Value::Object(_)) => {
          found.push(value);
          start = close + 1;
        }
        _ => start = open + 1,
      },
      None => start = open + 1,
    }
  }

  found
}

/// Index of the brace closing the one at `open`, honouring string literals.
fn balanced_end(bytes: &[u8], open: usize) -> Option<usize> {
  let mut depth = 0usize;
  let mut in_string = false;
  let mut escaped = false;

  for (i, &b) in bytes.iter().enumerate().skip(open) {
    if in_string {
      match b {
        _ if escaped => escaped = false,
        b'\\' => escaped = true,
        b'"' => in_string = false,
        b'\n' => return None,
        _ => {}
      }
      continue;
    }

    match b {
      b'"' => in_string = true,
      b'{' => depth += 1,
      b'}' => {
        depth -= 1;
        if depth == 0 {
          return Some(i);
        }
      }
      _ => {}
    }
  }

  None
}
