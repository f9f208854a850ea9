// src/codec.rs
//
// Wire codec for the three message shapes exchanged with the robot, the
// detector server and the case-log store. Framing is a 4-byte big-endian
// length prefix followed by UTF-8 JSON. Decoding either yields a fully
// validated typed message or an error; a malformed message is never
// partially applied.

use crate::error::PipelineError;
use crate::types::{CaseType, Detection, Label, Location, RobotStatus};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a framed payload. A length prefix beyond this is treated
/// as a malformed stream rather than an allocation request.
const MAX_PAYLOAD_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    DetectionPacket(DetectionPacket),
    DetectionResult(DetectionResult),
    CaseLogInsert(CaseLogInsert),
}

/// Robot -> server: per-frame detections plus piggybacked telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionPacket {
    pub frame_id: u64,
    pub detections: Vec<Detection>,
    pub robot_status: RobotStatus,
    pub location: Location,
}

/// Detector server -> aggregation pipeline: analyzed frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub frame_id: u64,
    pub timestamp: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Server -> case-log store: batch of case records to append or update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseLogInsert {
    pub logs: Vec<CaseRecord>,
}

/// Flat case row in the persistence schema. Flags are 0/1 integers to match
/// the store's column types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: u64,
    pub case_type: CaseType,
    pub detection_type: Label,
    pub robot_id: String,
    pub user_id: String,
    pub location: Location,
    pub is_ignored: u8,
    pub is_119_reported: u8,
    pub is_112_reported: u8,
    pub is_illegal_warned: u8,
    pub is_danger_warned: u8,
    pub is_emergency_warned: u8,
    pub is_case_closed: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl WireMessage {
    /// Range and shape checks that the serde schema alone cannot express.
    pub fn validate(&self) -> Result<(), PipelineError> {
        match self {
            Self::DetectionPacket(p) => validate_detections(&p.detections),
            Self::DetectionResult(r) => validate_detections(&r.detections),
            Self::CaseLogInsert(b) => {
                for record in &b.logs {
                    validate_record(record)?;
                }
                Ok(())
            }
        }
    }
}

fn validate_detections(detections: &[Detection]) -> Result<(), PipelineError> {
    for det in detections {
        if !(0.0..=1.0).contains(&det.confidence) {
            return Err(PipelineError::MalformedMessage(format!(
                "confidence {} outside [0,1] for label {}",
                det.confidence,
                det.label.as_str()
            )));
        }
        let [x1, y1, x2, y2] = det.bbox;
        if x1 >= x2 || y1 >= y2 {
            return Err(PipelineError::MalformedMessage(format!(
                "degenerate box [{x1},{y1},{x2},{y2}]"
            )));
        }
    }
    Ok(())
}

fn validate_record(record: &CaseRecord) -> Result<(), PipelineError> {
    let flags = [
        record.is_ignored,
        record.is_119_reported,
        record.is_112_reported,
        record.is_illegal_warned,
        record.is_danger_warned,
        record.is_emergency_warned,
        record.is_case_closed,
    ];
    if flags.iter().any(|&f| f > 1) {
        return Err(PipelineError::MalformedMessage(format!(
            "case {} has a flag outside {{0,1}}",
            record.case_id
        )));
    }
    if let Some(end) = record.end_time {
        if end < record.start_time {
            return Err(PipelineError::MalformedMessage(format!(
                "case {} ends before it starts",
                record.case_id
            )));
        }
    }
    Ok(())
}

/// Decode and validate a JSON payload into a typed message.
pub fn decode(payload: &[u8]) -> Result<WireMessage, PipelineError> {
    let msg: WireMessage = serde_json::from_slice(payload)
        .map_err(|e| PipelineError::MalformedMessage(e.to_string()))?;
    msg.validate()?;
    Ok(msg)
}

/// Encode a message to its JSON payload (no framing).
pub fn encode(msg: &WireMessage) -> Result<Vec<u8>, PipelineError> {
    serde_json::to_vec(msg).map_err(|e| PipelineError::MalformedMessage(e.to_string()))
}

/// Read one length-prefixed message from a stream. Returns `Ok(None)` on a
/// clean EOF at a frame boundary.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(decode(&payload)?)),
        None => Ok(None),
    }
}

/// Write one length-prefixed message to a stream.
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode(msg)?;
    write_frame(writer, &payload).await
}

/// Read one length-prefixed JSON value of an arbitrary shape (operator
/// commands, GUI notifications). Validation beyond the serde schema is the
/// caller's concern.
pub async fn read_json<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match read_frame(reader).await? {
        Some(payload) => {
            let value = serde_json::from_slice(&payload)
                .map_err(|e| PipelineError::MalformedMessage(e.to_string()))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Write one length-prefixed JSON value of an arbitrary shape.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload).await
}

/// Read one raw length-prefixed payload. `Ok(None)` on clean EOF.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header);
    if len > MAX_PAYLOAD_BYTES {
        // Stream-level corruption, not a skippable payload: the reader has
        // lost the frame boundary and the connection must drop.
        anyhow::bail!("frame length {len} exceeds {MAX_PAYLOAD_BYTES}");
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Write one raw length-prefixed payload.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let header = (payload.len() as u32).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
