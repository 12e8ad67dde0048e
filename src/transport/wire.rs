//! Line-framed session protocol.
//!
//! ```text
//! PUSH node=store001
//! BEGIN batch=12 channel=sales
//! INSERT sale eyJkYXRhX2lkIjo0Miwicm93Ijoi...   (base64 JSON record)
//! COMMIT batch=12
//! ACK {"batchId":12,"ok":true}
//! END
//! ```
//!
//! A batch is written with a single `write_all` of the whole frame. The reader
//! rejects a frame that ends before its COMMIT line.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::ack::AckMessage;
use crate::model::{BatchId, ChangeRecord, ChannelId, DataId, EventType, NodeId};
use crate::{Error, Result};

pub const ERROR_REGISTRATION: &str = "registration";
pub const ERROR_DEFERRED: &str = "deferred";

/// Longest line a reader accepts, terminator excluded.
pub const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The client sends batches and reads one ACK per batch.
    Push,
    /// The server streams the client's batches.
    Pull,
    /// The client delivers acknowledgments of pulled batches.
    Ack,
}

impl SessionKind {
    fn keyword(&self) -> &'static str {
        match self {
            SessionKind::Push => "PUSH",
            SessionKind::Pull => "PULL",
            SessionKind::Ack => "ACK",
        }
    }
}

/// Encoded body of one record line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub data_id: DataId,
    #[serde(default)]
    pub row: Option<String>,
    #[serde(default)]
    pub old: Option<String>,
    #[serde(default)]
    pub pk: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub event_type: EventType,
    pub table: String,
    pub payload: RecordPayload,
}

impl From<&ChangeRecord> for WireRecord {
    fn from(record: &ChangeRecord) -> Self {
        Self {
            event_type: record.event_type,
            table: record.table_name.clone(),
            payload: RecordPayload {
                data_id: record.data_id,
                row: record.row_data.clone(),
                old: record.old_data.clone(),
                pk: record.pk_data.clone(),
                schema: record.schema_version.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchFrame {
    pub batch_id: BatchId,
    pub channel_id: ChannelId,
    /// Set on the empty marker sent for a batch the operator ignored.
    pub ignored: bool,
    pub records: Vec<WireRecord>,
}

impl BatchFrame {
    /// `BEGIN batch=<id> channel=<id> ignored` followed directly by COMMIT.
    pub fn ignore_marker(batch_id: BatchId, channel_id: impl Into<ChannelId>) -> Self {
        Self {
            batch_id,
            channel_id: channel_id.into(),
            ignored: true,
            records: Vec::new(),
        }
    }

    pub fn byte_len(&self) -> u64 {
        self.records
            .iter()
            .map(|r| {
                [&r.payload.row, &r.payload.old, &r.payload.pk]
                    .iter()
                    .filter_map(|p| p.as_ref())
                    .map(|p| p.len() as u64)
                    .sum::<u64>()
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello { kind: SessionKind, node_id: NodeId },
    Batch(BatchFrame),
    Ack(AckMessage),
    End,
    Ok,
    Error { kind: String, message: String },
}

impl Message {
    pub fn registration_error(message: impl Into<String>) -> Self {
        Message::Error {
            kind: ERROR_REGISTRATION.to_string(),
            message: message.into(),
        }
    }

    /// Reply to a pushed batch that waits behind an earlier failed batch.
    pub fn deferred_error(message: impl Into<String>) -> Self {
        Message::Error {
            kind: ERROR_DEFERRED.to_string(),
            message: message.into(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Message::Hello { kind, node_id } => {
                put_line(buf, &format!("{} node={}", kind.keyword(), node_id));
            }
            Message::Batch(frame) => {
                let mut begin =
                    format!("BEGIN batch={} channel={}", frame.batch_id, frame.channel_id);
                if frame.ignored {
                    begin.push_str(" ignored");
                }
                put_line(buf, &begin);
                for record in &frame.records {
                    let json = serde_json::to_vec(&record.payload)?;
                    put_line(
                        buf,
                        &format!(
                            "{} {} {}",
                            record.event_type,
                            record.table,
                            BASE64.encode(json)
                        ),
                    );
                }
                put_line(buf, &format!("COMMIT batch={}", frame.batch_id));
            }
            Message::Ack(ack) => {
                put_line(buf, &format!("ACK {}", serde_json::to_string(ack)?));
            }
            Message::End => put_line(buf, "END"),
            Message::Ok => put_line(buf, "OK"),
            Message::Error { kind, message } => {
                put_line(buf, &format!("ERROR {} {}", kind, message.replace('\n', " ")));
            }
        }
        Ok(())
    }
}

fn put_line(buf: &mut BytesMut, line: &str) {
    buf.reserve(line.len() + 1);
    buf.put_slice(line.as_bytes());
    buf.put_u8(b'\n');
}

/// Bounds one I/O call by the session's maximum duration.
pub(crate) async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout {
            message: format!("{} exceeded {:?}", what, limit),
        })?
}

pub struct FrameWriter<W> {
    inner: W,
    io_timeout: Duration,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, io_timeout: Duration) -> Self {
        Self { inner, io_timeout }
    }

    pub async fn send(&mut self, message: &Message) -> Result<()> {
        let mut buf = BytesMut::with_capacity(256);
        message.encode(&mut buf)?;
        trace!(bytes = buf.len(), "Writing frame");
        let inner = &mut self.inner;
        with_timeout(self.io_timeout, "write", async move {
            inner.write_all(&buf).await?;
            inner.flush().await?;
            Ok(())
        })
        .await
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    io_timeout: Duration,
    max_line: usize,
    line: String,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, io_timeout: Duration) -> Self {
        Self {
            inner: BufReader::new(inner),
            io_timeout,
            max_line: MAX_LINE_BYTES,
            line: String::new(),
        }
    }

    pub fn with_max_line(mut self, max_line: usize) -> Self {
        self.max_line = max_line;
        self
    }

    /// Next line without its terminator, or `None` at end of stream.
    async fn read_line(&mut self) -> Result<Option<String>> {
        self.line.clear();
        // One byte over the cap leaves room for the terminator of a maximal line.
        let limit = self.max_line as u64 + 1;
        let (inner, line) = (&mut self.inner, &mut self.line);
        let n = with_timeout(self.io_timeout, "read", async move {
            let mut bounded = inner.take(limit);
            Ok(bounded.read_line(line).await?)
        })
        .await?;
        if n == 0 {
            return Ok(None);
        }
        if n as u64 == limit && !self.line.ends_with('\n') {
            return Err(Error::Protocol(format!(
                "line exceeds {} bytes",
                self.max_line
            )));
        }
        Ok(Some(self.line.trim_end_matches(['\n', '\r']).to_string()))
    }

    /// Next message, or `None` when the peer closed the stream between messages.
    pub async fn receive(&mut self) -> Result<Option<Message>> {
        let line = match self.read_line().await? {
            Some(line) => line,
            None => return Ok(None),
        };
        let (keyword, rest) = line.split_once(' ').unwrap_or((line.as_str(), ""));
        let message = match keyword {
            "PUSH" | "PULL" => Message::Hello {
                kind: if keyword == "PUSH" {
                    SessionKind::Push
                } else {
                    SessionKind::Pull
                },
                node_id: field(rest, "node")?.to_string(),
            },
            "ACK" if rest.starts_with("node=") => Message::Hello {
                kind: SessionKind::Ack,
                node_id: field(rest, "node")?.to_string(),
            },
            "ACK" => Message::Ack(serde_json::from_str(rest)?),
            "BEGIN" => {
                let batch_id = parse_batch_id(field(rest, "batch")?)?;
                let channel_id = field(rest, "channel")?.to_string();
                let ignored = rest.split_whitespace().any(|token| token == "ignored");
                Message::Batch(self.read_batch(batch_id, channel_id, ignored).await?)
            }
            "END" => Message::End,
            "OK" => Message::Ok,
            "ERROR" => {
                let (kind, message) = rest.split_once(' ').unwrap_or((rest, ""));
                Message::Error {
                    kind: kind.to_string(),
                    message: message.to_string(),
                }
            }
            other => {
                return Err(Error::Protocol(format!("unexpected line: {}", other)));
            }
        };
        Ok(Some(message))
    }

    async fn read_batch(
        &mut self,
        batch_id: BatchId,
        channel_id: ChannelId,
        ignored: bool,
    ) -> Result<BatchFrame> {
        let mut records = Vec::new();
        loop {
            let line = self.read_line().await?.ok_or_else(|| {
                Error::Protocol(format!("batch {} ended before COMMIT", batch_id))
            })?;
            if let Some(rest) = line.strip_prefix("COMMIT ") {
                let committed = parse_batch_id(field(rest, "batch")?)?;
                if committed != batch_id {
                    return Err(Error::Protocol(format!(
                        "COMMIT for batch {} inside batch {}",
                        committed, batch_id
                    )));
                }
                return Ok(BatchFrame {
                    batch_id,
                    channel_id,
                    ignored,
                    records,
                });
            }
            if ignored {
                return Err(Error::Protocol(format!(
                    "ignored batch {} carries records",
                    batch_id
                )));
            }
            records.push(parse_record(&line)?);
        }
    }
}

fn field<'a>(rest: &'a str, name: &str) -> Result<&'a str> {
    rest.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .ok_or_else(|| Error::Protocol(format!("missing {}= in '{}'", name, rest)))
}

fn parse_batch_id(text: &str) -> Result<BatchId> {
    text.parse()
        .map_err(|_| Error::Protocol(format!("invalid batch id '{}'", text)))
}

fn parse_record(line: &str) -> Result<WireRecord> {
    let mut parts = line.splitn(3, ' ');
    let (event, table, body) = match (parts.next(), parts.next(), parts.next()) {
        (Some(event), Some(table), Some(body)) => (event, table, body),
        _ => return Err(Error::Protocol(format!("malformed record line '{}'", line))),
    };
    let event_type = event
        .parse::<EventType>()
        .map_err(|e| Error::Protocol(e.to_string()))?;
    let json = BASE64
        .decode(body)
        .map_err(|e| Error::Protocol(format!("record payload is not base64: {}", e)))?;
    Ok(WireRecord {
        event_type,
        table: table.to_string(),
        payload: serde_json::from_slice(&json)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    const IO: Duration = Duration::from_secs(5);

    fn frame() -> BatchFrame {
        let mut record = MemoryStore::record(
            "sales",
            "sale",
            EventType::Insert,
            json!({"id": 1, "note": "two words\nand a newline"}),
            Some("tx1"),
        );
        record.data_id = 42;
        BatchFrame {
            batch_id: 12,
            channel_id: "sales".into(),
            ignored: false,
            records: vec![WireRecord::from(&record)],
        }
    }

    #[tokio::test]
    async fn test_session_messages_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client, IO);
        let mut reader = FrameReader::new(server, IO);

        writer
            .send(&Message::Hello {
                kind: SessionKind::Push,
                node_id: "corp".into(),
            })
            .await
            .unwrap();
        writer.send(&Message::Batch(frame())).await.unwrap();
        writer
            .send(&Message::Ack(AckMessage::ok(12, 3)))
            .await
            .unwrap();
        writer.send(&Message::End).await.unwrap();

        assert_eq!(
            reader.receive().await.unwrap(),
            Some(Message::Hello {
                kind: SessionKind::Push,
                node_id: "corp".into()
            })
        );
        assert_eq!(
            reader.receive().await.unwrap(),
            Some(Message::Batch(frame()))
        );
        assert_eq!(
            reader.receive().await.unwrap(),
            Some(Message::Ack(AckMessage::ok(12, 3)))
        );
        assert_eq!(reader.receive().await.unwrap(), Some(Message::End));
    }

    #[tokio::test]
    async fn test_ignore_marker_has_flag_and_no_records() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client, IO);
        writer
            .send(&Message::Batch(BatchFrame::ignore_marker(7, "sales")))
            .await
            .unwrap();
        drop(writer);

        let mut text = String::new();
        server.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "BEGIN batch=7 channel=sales ignored\nCOMMIT batch=7\n");

        let (mut client, server) = tokio::io::duplex(4096);
        client.write_all(text.as_bytes()).await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server, IO);
        assert_eq!(
            reader.receive().await.unwrap(),
            Some(Message::Batch(BatchFrame::ignore_marker(7, "sales")))
        );
    }

    #[tokio::test]
    async fn test_unterminated_batch_is_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"BEGIN batch=1 channel=sales\n")
            .await
            .unwrap();
        drop(client);

        let mut reader = FrameReader::new(server, IO);
        assert!(matches!(reader.receive().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_ack_hello_is_distinct_from_ack_message() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client, IO);
        writer
            .send(&Message::Hello {
                kind: SessionKind::Ack,
                node_id: "store001".into(),
            })
            .await
            .unwrap();
        writer
            .send(&Message::registration_error("node store009 is not registered"))
            .await
            .unwrap();

        let mut reader = FrameReader::new(server, IO);
        assert!(matches!(
            reader.receive().await.unwrap(),
            Some(Message::Hello {
                kind: SessionKind::Ack,
                ..
            })
        ));
        match reader.receive().await.unwrap() {
            Some(Message::Error { kind, message }) => {
                assert_eq!(kind, "registration");
                assert_eq!(message, "node store009 is not registered");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_line_is_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"BEGIN batch=1 channel=sales\nINSERT sale AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n")
            .await
            .unwrap();

        let mut reader = FrameReader::new(server, IO).with_max_line(32);
        match reader.receive().await {
            Err(Error::Protocol(message)) => assert!(message.contains("exceeds 32 bytes")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(server, Duration::from_millis(20));
        assert!(matches!(
            reader.receive().await,
            Err(Error::Timeout { .. })
        ));
    }
}
