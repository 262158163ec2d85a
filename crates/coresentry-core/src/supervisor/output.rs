//! Captured core output and startup marker detection.
//!
//! Each spawned core gets two [`OutputBuffer`]s (stdout and stderr) filled by
//! background capture tasks. The startup poller decodes the stdout snapshot
//! and looks for the configured success or fatal marker.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};

use encoding_rs::Encoding;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Bounded, shared byte buffer. Once `cap` is exceeded the oldest bytes are
/// discarded.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
    cap: usize,
}

impl OutputBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(Vec::new())),
            cap,
        }
    }

    pub fn append(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        bytes.extend_from_slice(chunk);
        if bytes.len() > self.cap {
            let excess = bytes.len() - self.cap;
            bytes.drain(..excess);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copy everything read from `reader` into `buffer` until EOF, optionally
/// mirroring it to the daemon's own stdout.
pub fn spawn_capture<R>(mut reader: R, buffer: OutputBuffer, mirror: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut chunk = vec![0u8; 8 * 1024];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    buffer.append(&chunk[..n]);
                    if mirror {
                        let _ = stdout.write_all(&chunk[..n]).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Core output capture failed");
                    break;
                }
            }
        }
        let _ = stdout.flush().await;
        debug!(bytes = buffer.len(), "Core output stream closed");
    })
}

/// Decodes raw core output to text, optionally from a legacy encoding.
#[derive(Debug, Clone, Copy)]
pub struct OutputDecoder {
    encoding: Option<&'static Encoding>,
}

impl OutputDecoder {
    /// Build a decoder for a WHATWG encoding label such as `"gbk"`.
    ///
    /// `None` or an unknown label decodes as lossy UTF-8.
    pub fn new(label: Option<&str>) -> Self {
        let encoding = label.and_then(|l| {
            let found = Encoding::for_label(l.trim().as_bytes());
            if found.is_none() {
                warn!(label = l, "Unknown output encoding, falling back to UTF-8");
            }
            found
        });
        Self { encoding }
    }

    pub fn decode<'a>(&self, raw: &'a [u8]) -> Cow<'a, str> {
        match self.encoding {
            Some(encoding) => encoding.decode(raw).0,
            None => String::from_utf8_lossy(raw),
        }
    }
}

/// Result of scanning captured output during startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupOutcome {
    Ready,
    Fatal(String),
}

/// Scan `output` for the startup markers. The success marker wins when both
/// are present.
pub fn detect_startup(output: &str, success_marker: &str, fatal_marker: &str) -> Option<StartupOutcome> {
    if output.contains(success_marker) {
        Some(StartupOutcome::Ready)
    } else if output.contains(fatal_marker) {
        Some(StartupOutcome::Fatal(extract_fatal_message(output, fatal_marker)))
    } else {
        None
    }
}

/// Extract the message following the fatal marker.
///
/// Handles logfmt style `level=fatal msg="..."` lines: the `msg=` key and
/// surrounding quotes are stripped and only the rest of that line is kept.
pub fn extract_fatal_message(output: &str, fatal_marker: &str) -> String {
    let Some(start) = output.find(fatal_marker) else {
        return "fatal error reported by core".to_string();
    };
    let rest = &output[start + fatal_marker.len()..];
    let line = rest.lines().next().unwrap_or_default().trim();
    let line = line.strip_prefix("msg=").unwrap_or(line);
    let message = line
        .strip_prefix('"')
        .and_then(|l| l.strip_suffix('"'))
        .unwrap_or(line)
        .trim();

    if message.is_empty() {
        "fatal error reported by core".to_string()
    } else {
        message.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SUCCESS: &str = "Start initial Compatible provider default";
    const FATAL: &str = "level=fatal";

    #[test]
    fn test_buffer_discards_oldest_bytes() {
        let buffer = OutputBuffer::new(8);
        buffer.append(b"0123456");
        buffer.append(b"789ab");
        assert_eq!(buffer.snapshot(), b"456789ab");
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn test_detect_success() {
        let out = "level=info msg=\"loading\"\nlevel=info msg=\"Start initial Compatible provider default\"\n";
        assert_eq!(detect_startup(out, SUCCESS, FATAL), Some(StartupOutcome::Ready));
    }

    #[test]
    fn test_detect_pending() {
        assert_eq!(detect_startup("level=info msg=\"loading\"", SUCCESS, FATAL), None);
    }

    #[test]
    fn test_detect_fatal_extracts_message() {
        let out = "level=info msg=\"parsing\"\ntime=\"x\" level=fatal msg=\"Parse config error: bad yaml\"\nexit\n";
        assert_eq!(
            detect_startup(out, SUCCESS, FATAL),
            Some(StartupOutcome::Fatal("Parse config error: bad yaml".to_string()))
        );
    }

    #[test]
    fn test_fatal_without_message_key() {
        assert_eq!(extract_fatal_message("level=fatal  port in use", FATAL), "port in use");
        assert_eq!(extract_fatal_message("level=fatal", FATAL), "fatal error reported by core");
    }

    #[test]
    fn test_decoder_gbk() {
        // "没有找到进程" in GBK
        let raw: &[u8] = &[
            0xc3, 0xbb, 0xd3, 0xd0, 0xd5, 0xd2, 0xb5, 0xbd, 0xbd, 0xf8, 0xb3, 0xcc,
        ];
        let decoder = OutputDecoder::new(Some("gbk"));
        assert_eq!(decoder.decode(raw), "没有找到进程");
    }

    #[test]
    fn test_decoder_defaults_to_lossy_utf8() {
        let decoder = OutputDecoder::new(None);
        assert_eq!(decoder.decode(b"ok \xff"), "ok \u{fffd}");
        let unknown = OutputDecoder::new(Some("not-an-encoding"));
        assert_eq!(unknown.decode(b"plain"), "plain");
    }
}
