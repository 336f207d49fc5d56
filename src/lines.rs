//! Newline chunking for worker output streams
//!
//! Worker subprocesses write free-form bytes to stdout and stderr. The pool
//! forwards that output into the logger at line granularity: every
//! newline-terminated line is delivered exactly once, in order, with the
//! trailing newline stripped. A partial final line is delivered when the
//! stream closes.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Read buffer size for worker output pipes
const READ_CHUNK: usize = 8192;

/// Accumulates bytes and emits complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, invoking `sink` once per completed line.
    ///
    /// Invalid UTF-8 is replaced lossily.
    pub fn feed<F: FnMut(&str)>(&mut self, chunk: &[u8], mut sink: F) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos);
            if self.partial.is_empty() {
                sink(&String::from_utf8_lossy(line));
            } else {
                self.partial.extend_from_slice(line);
                sink(&String::from_utf8_lossy(&self.partial));
                self.partial.clear();
            }
            rest = &tail[1..];
        }
        self.partial.extend_from_slice(rest);
    }

    /// Flush a partial final line, if any. Called once when the stream closes.
    pub fn finish<F: FnMut(&str)>(&mut self, mut sink: F) {
        if !self.partial.is_empty() {
            sink(&String::from_utf8_lossy(&self.partial));
            self.partial.clear();
        }
    }
}

/// Pump an async byte stream through a [`LineBuffer`] until EOF.
///
/// Read errors terminate the pump; the partial line collected so far is
/// still flushed.
pub async fn forward_lines<R, F>(mut reader: R, mut sink: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut buffer = LineBuffer::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buffer.feed(&chunk[..n], &mut sink),
        }
    }
    buffer.finish(&mut sink);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&[u8]]) -> Vec<String> {
        let mut buffer = LineBuffer::new();
        let mut lines = Vec::new();
        for chunk in chunks {
            buffer.feed(chunk, |line| lines.push(line.to_string()));
        }
        buffer.finish(|line| lines.push(line.to_string()));
        lines
    }

    #[test]
    fn test_single_chunk_multiple_lines() {
        let lines = collect(&[b"one\ntwo\nthree\n"]);
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let lines = collect(&[b"hel", b"lo\nwor", b"ld\n"]);
        assert_eq!(lines, vec!["hello", "world"]);
    }

    #[test]
    fn test_partial_final_line_flushed_on_close() {
        let lines = collect(&[b"done\nno newline"]);
        assert_eq!(lines, vec!["done", "no newline"]);
    }

    #[test]
    fn test_empty_lines_preserved() {
        let lines = collect(&[b"a\n\nb\n"]);
        assert_eq!(lines, vec!["a", "", "b"]);
    }

    #[test]
    fn test_no_output_no_lines() {
        assert!(collect(&[]).is_empty());
        assert!(collect(&[b""]).is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let lines = collect(&[b"ok \xff\xfe end\n"]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" end"));
    }

    #[tokio::test]
    async fn test_forward_lines_from_reader() {
        let data: &[u8] = b"first\nsecond\ntail";
        let mut lines = Vec::new();
        forward_lines(data, |line| lines.push(line.to_string())).await;
        assert_eq!(lines, vec!["first", "second", "tail"]);
    }
}
