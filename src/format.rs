use crate::{config::FormatConfig, types::ExecutionResult};

/// Bytes reserved for the omission marker when sizing head and tail.
const MARKER_RESERVE: usize = 64;

/// How far a cut may move to land on a newline instead of mid-line.
const NEWLINE_SLACK: usize = 80;

/// Fence and header overhead reserved out of the total render budget.
const SECTION_OVERHEAD: usize = 256;

/// A result rendered for the chat channel: ordered segments, each within the
/// message limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedOutput {
    pub segments: Vec<String>,
    pub truncated: bool,
}

/// Renders execution results into chat messages. Section order is fixed:
/// compiler output, stdout, stderr, then a summary line.
pub struct ResultFormatter {
    config: FormatConfig,
}

impl ResultFormatter {
    pub fn new(config: FormatConfig) -> Self {
        Self { config }
    }

    pub fn format(&self, result: &ExecutionResult) -> RenderedOutput {
        let budget = self
            .config
            .message_limit
            .saturating_mul(self.config.max_segments)
            .saturating_sub(SECTION_OVERHEAD)
            .max(MARKER_RESERVE * 2);

        let streams = [
            &result.compile_output,
            &result.stdout,
            &result.stderr,
        ];
        let non_empty = streams.iter().filter(|s| !s.is_empty()).count().max(1);
        let stream_cap = budget / non_empty;

        let mut truncated = false;
        let (compile_output, stdout, stderr) = (
            shorten_middle(&result.compile_output, stream_cap, &mut truncated),
            shorten_middle(&result.stdout, stream_cap, &mut truncated),
            shorten_middle(&result.stderr, stream_cap, &mut truncated),
        );

        let mut body = String::new();
        if !compile_output.is_empty() {
            body.push_str("Compiler output:\n");
            push_fenced(&mut body, &compile_output);
        }
        if !stdout.is_empty() {
            push_fenced(&mut body, &stdout);
        }
        if !stderr.is_empty() {
            body.push_str("Stderr:\n");
            push_fenced(&mut body, &stderr);
        }
        if compile_output.is_empty() && stdout.is_empty() && stderr.is_empty() {
            body.push_str("<no output>\n");
        }
        body.push_str(&summary_line(result));

        RenderedOutput {
            segments: split_segments(&body, self.config.message_limit),
            truncated,
        }
    }
}

fn push_fenced(body: &mut String, text: &str) {
    body.push_str("```\n");
    body.push_str(text);
    if !text.ends_with('\n') {
        body.push('\n');
    }
    body.push_str("```\n");
}

fn summary_line(result: &ExecutionResult) -> String {
    match &result.signal {
        Some(signal) => format!(
            "Killed by signal {} after {} ms",
            signal,
            result.duration.as_millis()
        ),
        None => format!(
            "Exit code {} in {} ms",
            result.exit_code,
            result.duration.as_millis()
        ),
    }
}

/// Head+tail truncation: keep a prefix and a suffix and replace the middle
/// with a single marker counting the omitted bytes. Cuts land on char
/// boundaries, preferring newlines.
fn shorten_middle(text: &str, max: usize, truncated: &mut bool) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    *truncated = true;

    let keep = max.saturating_sub(MARKER_RESERVE).max(2);
    let head_target = keep / 2;
    let tail_target = keep - head_target;

    let head_end = cut_before(text, head_target);
    let tail_start = cut_after(text, text.len() - tail_target);
    let omitted = tail_start - head_end;

    format!(
        "{}\n… <+{} bytes omitted> …\n{}",
        &text[..head_end],
        omitted,
        &text[tail_start..]
    )
}

/// Largest cut index ≤ `at` on a char boundary, pulled back to a newline when
/// one is close enough.
fn cut_before(text: &str, at: usize) -> usize {
    let mut index = at.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    if let Some(newline) = text[..index].rfind('\n') {
        if index - newline <= NEWLINE_SLACK {
            return newline;
        }
    }
    index
}

/// Smallest cut index ≥ `at` on a char boundary, pushed forward past the next
/// newline when one is close enough.
fn cut_after(text: &str, at: usize) -> usize {
    let mut index = at.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    if let Some(newline) = text[index..].find('\n') {
        if newline < NEWLINE_SLACK && index + newline + 1 <= text.len() {
            return index + newline + 1;
        }
    }
    index
}

/// Split text into ordered chunks no longer than `limit` bytes, cutting on
/// line boundaries where possible and char boundaries otherwise.
fn split_segments(text: &str, limit: usize) -> Vec<String> {
    debug_assert!(limit > 0);
    let mut segments = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut cut = limit;
        while cut > 0 && !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if let Some(newline) = rest[..cut].rfind('\n') {
            if newline > 0 {
                cut = newline + 1;
            }
        }
        segments.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    if !rest.is_empty() || segments.is_empty() {
        segments.push(rest.to_string());
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn result(stdout: &str, stderr: &str, compile_output: &str) -> ExecutionResult {
        ExecutionResult {
            request_id: Uuid::new_v4(),
            exit_code: 0,
            signal: None,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            compile_output: compile_output.to_string(),
            duration: Duration::from_millis(17),
        }
    }

    fn formatter(limit: usize, max_segments: usize) -> ResultFormatter {
        ResultFormatter::new(FormatConfig {
            message_limit: limit,
            max_segments,
        })
    }

    #[test]
    fn small_output_is_one_untruncated_segment() {
        let rendered = formatter(2000, 4).format(&result("2\n", "", ""));
        assert_eq!(rendered.segments.len(), 1);
        assert!(!rendered.truncated);
        assert_eq!(rendered.segments[0], "```\n2\n```\nExit code 0 in 17 ms");
    }

    #[test]
    fn sections_appear_in_fixed_order() {
        let rendered = formatter(2000, 4).format(&result("ALPHA", "BRAVO", "CHARLIE"));
        let text = rendered.segments.join("");
        let compile_at = text.find("CHARLIE").unwrap();
        let stdout_at = text.find("ALPHA").unwrap();
        let stderr_at = text.find("BRAVO").unwrap();
        let summary_at = text.find("Exit code 0").unwrap();
        assert!(compile_at < stdout_at);
        assert!(stdout_at < stderr_at);
        assert!(stderr_at < summary_at);
    }

    #[test]
    fn signal_wins_the_summary_line() {
        let mut r = result("", "", "");
        r.signal = Some("SIGKILL".to_string());
        let rendered = formatter(2000, 4).format(&r);
        assert!(rendered.segments[0].contains("Killed by signal SIGKILL"));
        assert!(rendered.segments[0].contains("<no output>"));
    }

    #[test]
    fn huge_output_gets_one_marker_head_and_tail() {
        let line = "0123456789abcdef\n";
        let big: String = line.repeat(3000); // ~51k bytes
        let rendered = formatter(2000, 4).format(&result(&big, "", ""));

        assert!(rendered.truncated);
        let text = rendered.segments.join("");
        assert_eq!(text.matches("bytes omitted").count(), 1);
        // head and tail both survive
        let body_start = text.find("```\n").unwrap() + 4;
        assert!(text[body_start..].starts_with(line));
        assert!(text.contains(&format!("…\n{}", line)));
        for segment in &rendered.segments {
            assert!(segment.len() <= 2000, "segment of {} bytes", segment.len());
        }
    }

    #[test]
    fn marker_appears_iff_truncated() {
        let small = formatter(2000, 4).format(&result("tiny\n", "", ""));
        assert!(!small.truncated);
        assert!(!small.segments.join("").contains("bytes omitted"));

        let large = formatter(200, 2).format(&result(&"x".repeat(5000), "", ""));
        assert!(large.truncated);
        assert!(large.segments.join("").contains("bytes omitted"));
    }

    #[test]
    fn moderate_output_splits_into_ordered_segments() {
        // bigger than one message, smaller than the total budget
        let body: String = (0..250)
            .map(|i| format!("line number {i:04}\n"))
            .collect();
        let rendered = formatter(1000, 8).format(&result(&body, "", ""));

        assert!(!rendered.truncated);
        assert!(rendered.segments.len() > 1);
        for segment in &rendered.segments {
            assert!(segment.len() <= 1000);
        }
        let joined = rendered.segments.join("");
        assert!(joined.contains("line number 0000"));
        assert!(joined.contains("line number 0249"));
    }

    #[test]
    fn truncation_never_splits_multibyte_chars() {
        // slicing through a multi-byte char would panic inside format
        let big = "héllo wörld – ünïcode ✓\n".repeat(2000);
        let rendered = formatter(500, 2).format(&result(&big, "", ""));
        assert!(rendered.truncated);
        for segment in &rendered.segments {
            assert!(segment.len() <= 500);
        }
    }

    #[test]
    fn empty_streams_render_placeholder() {
        let rendered = formatter(2000, 4).format(&result("", "", ""));
        assert!(rendered.segments[0].starts_with("<no output>"));
    }

    #[test]
    fn budget_is_shared_across_noisy_streams() {
        let noisy = "e".repeat(10_000);
        let rendered = formatter(500, 4).format(&result(&noisy, &noisy, &noisy));
        assert!(rendered.truncated);
        for segment in &rendered.segments {
            assert!(segment.len() <= 500);
        }
    }
}
