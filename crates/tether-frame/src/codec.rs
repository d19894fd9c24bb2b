use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::envelope::Envelope;
use crate::error::{FrameError, Result};

/// Default maximum inbound frame length: 16 MiB.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Configuration for the envelope codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum length of one inbound line, excluding the terminator.
    pub max_frame_length: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

/// Newline-delimited JSON codec for [`Envelope`]s.
///
/// Wire format:
/// ```text
/// {"type":"ready","data":{"options":{}}}\n
/// {"type":"close"}\n
/// ```
///
/// Blank lines are ignored and a line that is not a valid envelope is logged
/// and skipped. A line longer than the configured maximum is an error, as is
/// a stream that ends partway through a line.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    max_frame_length: usize,
    // Bytes already scanned for a terminator in the current buffer.
    next_index: usize,
}

impl EnvelopeCodec {
    /// Create a codec with default configuration.
    pub fn new() -> Self {
        Self::with_config(&FrameConfig::default())
    }

    /// Create a codec with explicit configuration.
    pub fn with_config(config: &FrameConfig) -> Self {
        Self {
            max_frame_length: config.max_frame_length,
            next_index: 0,
        }
    }

    /// Maximum accepted inbound line length.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        loop {
            let search_end = src.len().min(self.max_frame_length.saturating_add(1));
            let newline = src[self.next_index..search_end]
                .iter()
                .position(|b| *b == b'\n');

            let Some(offset) = newline else {
                if src.len() > self.max_frame_length {
                    return Err(FrameError::PayloadTooLarge {
                        size: src.len(),
                        max: self.max_frame_length,
                    });
                }
                self.next_index = src.len();
                return Ok(None); // Need more data
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(end + 1);
            let line = line[..end].trim_ascii();
            if line.is_empty() {
                continue;
            }

            match serde_json::from_slice::<Envelope>(line) {
                Ok(envelope) => return Ok(Some(envelope)),
                Err(err) => {
                    warn!(error = %err, size = line.len(), "skipping malformed envelope");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        if let Some(envelope) = self.decode(src)? {
            return Ok(Some(envelope));
        }
        if src.iter().all(u8::is_ascii_whitespace) {
            src.clear();
            self.next_index = 0;
            return Ok(None);
        }
        Err(FrameError::ConnectionClosed)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let payload = serde_json::to_vec(&item)?;
        dst.reserve(payload.len() + 1);
        dst.put_slice(&payload);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::envelope::{CLOSE, READY};

    fn decode_all(codec: &mut EnvelopeCodec, buf: &mut BytesMut) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Some(envelope) = codec.decode(buf).unwrap() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn decodes_single_line() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"close\"}\n"[..]);

        let envelope = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(envelope.kind, CLOSE);
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_multiple_lines_in_order() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(
            &b"{\"type\":\"ready\",\"data\":{\"options\":{}}}\n{\"type\":\"sync\"}\n{\"type\":\"close\"}\n"[..],
        );

        let kinds: Vec<_> = decode_all(&mut codec, &mut buf)
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, ["ready", "sync", "close"]);
    }

    #[test]
    fn waits_for_terminator_across_reads() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"re"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ady\"}\n");
        let envelope = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(envelope.kind, READY);
    }

    #[test]
    fn tolerates_crlf_and_blank_lines() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"\r\n\n{\"type\":\"close\"}\r\n"[..]);

        let envelopes = decode_all(&mut codec, &mut buf);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind, CLOSE);
    }

    #[test]
    fn skips_malformed_line_and_continues() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"not json\n{\"data\":1}\n{\"type\":\"close\"}\n"[..]);

        let envelopes = decode_all(&mut codec, &mut buf);
        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind, CLOSE);
    }

    #[test]
    fn rejects_oversized_line() {
        let mut codec = EnvelopeCodec::with_config(&FrameConfig {
            max_frame_length: 16,
        });
        let mut buf = BytesMut::from(&b"{\"type\":\"aaaaaaaaaaaaaaaaaaaa\"}"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { max: 16, .. }));
    }

    #[test]
    fn accepts_line_at_exact_limit() {
        let line = br#"{"type":"close"}"#;
        let mut codec = EnvelopeCodec::with_config(&FrameConfig {
            max_frame_length: line.len(),
        });
        let mut buf = BytesMut::from(&line[..]);
        buf.put_u8(b'\n');

        assert!(codec.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn eof_mid_line_is_connection_closed() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"clo"[..]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn eof_with_trailing_whitespace_is_clean() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::from(&b"{\"type\":\"close\"}\n \r\n"[..]);

        assert!(codec.decode_eof(&mut buf).unwrap().is_some());
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_terminates_with_newline() {
        let mut codec = EnvelopeCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Envelope::new("log", json!("multi\nline")), &mut buf)
            .unwrap();

        assert_eq!(&buf[..], b"{\"type\":\"log\",\"data\":\"multi\\nline\"}\n");
    }

    #[tokio::test]
    async fn framed_stream_preserves_order() {
        let (left, right) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(left, EnvelopeCodec::new());
        let mut reader = FramedRead::new(right, EnvelopeCodec::new());

        let sender = tokio::spawn(async move {
            for i in 0..32 {
                writer
                    .send(Envelope::new("data", json!({ "seq": i })))
                    .await
                    .unwrap();
            }
        });

        for expected in 0..32 {
            let envelope = reader.next().await.unwrap().unwrap();
            assert_eq!(envelope.data["seq"], expected);
        }
        sender.await.unwrap();
        assert!(reader.next().await.is_none());
    }
}
