// ABOUTME: Merges a child's stdout and stderr into one ordered channel of lines.
// ABOUTME: Also classifies lines as info or error for the install log stream.

use regex::Regex;
use std::sync::LazyLock;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::types::{LineLevel, OutputLine, StreamKind};

const CHANNEL_CAPACITY: usize = 512;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|errors|traceback|exception|failed|fatal)\b").expect("error line regex")
});

/// Decide whether an output line should be shown as an error.
pub fn classify_line(text: &str) -> LineLevel {
    if ERROR_LINE.is_match(text) {
        LineLevel::Error
    } else {
        LineLevel::Info
    }
}

/// Line reader tasks attached to one child process.
///
/// Dropping the value aborts the readers, which closes the pipes on our side.
pub struct LineStreams {
    rx: mpsc::Receiver<OutputLine>,
    readers: Vec<JoinHandle<()>>,
}

impl LineStreams {
    /// Take the child's piped stdout/stderr and start one reader per stream.
    pub fn attach(child: &mut Child) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, StreamKind::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, StreamKind::Stderr, tx));
        }
        Self { rx, readers }
    }

    /// Next line from either stream, or `None` once both have closed.
    pub async fn next(&mut self) -> Option<OutputLine> {
        self.rx.recv().await
    }

    pub fn abort(&self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

impl Drop for LineStreams {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_reader<R>(stream: R, kind: StreamKind, tx: mpsc::Sender<OutputLine>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(OutputLine { stream: kind, text }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    log::debug!("[LineStreams] {:?} read error: {}", kind, e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_errors_and_tracebacks() {
        assert_eq!(classify_line("Traceback (most recent call last):"), LineLevel::Error);
        assert_eq!(classify_line("error: Failed to fetch"), LineLevel::Error);
        assert_eq!(classify_line("Resolved 42 packages in 1.2s"), LineLevel::Info);
        // Substrings inside words do not count.
        assert_eq!(classify_line("installing errorhandler-1.0"), LineLevel::Info);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_both_streams_until_close() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo out1; echo err1 >&2; printf 'no-newline'")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let mut streams = LineStreams::attach(&mut child);
        let mut lines = Vec::new();
        while let Some(line) = streams.next().await {
            lines.push(line);
        }
        child.wait().await.unwrap();

        assert!(lines.contains(&OutputLine::stdout("out1")));
        assert!(lines.contains(&OutputLine::stderr("err1")));
        assert!(lines.contains(&OutputLine::stdout("no-newline")));
        assert_eq!(lines.len(), 3);
    }
}
