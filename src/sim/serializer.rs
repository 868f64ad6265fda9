//! Frame Serializer
//!
//! Checksums and full-frame encoding share one walk over the frame (see
//! [`BitStream`]). The full-frame format is:
//!
//! ```text
//! gzip( [i32 mode][i32 tick][u64 checksum]
//!       [u32 len][player block]
//!       [u32 len][state block]
//!       [u32 len][dynamic asset block] )
//! ```
//!
//! Restoring a frame recomputes its checksum and rejects the data if it does
//! not match the embedded one.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

use crate::core::stream::{BitStream, StreamError, StreamMode};
use crate::sim::frame::{Frame, FrameError, Tick};

/// The only frame data mode: every block present.
pub const FRAME_DATA_MODE_FULL: i32 = 1;

/// gzip-compress a buffer.
pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2 + 64), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Decompress a gzip buffer.
pub fn gunzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    GzDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}

/// Reusable serializer.
///
/// Holds a scratch stream so repeated checksums do not allocate. One
/// instance must not be used for two frames at the same time; parallel
/// checksums need one serializer each.
#[derive(Debug)]
pub struct FrameSerializer {
    scratch: BitStream,
}

impl Default for FrameSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSerializer {
    /// New serializer.
    pub fn new() -> Self {
        Self {
            scratch: BitStream::checksum(),
        }
    }

    /// 64-bit checksum of the frame's logical state.
    pub fn checksum(&mut self, frame: &mut Frame) -> Result<u64, FrameError> {
        let stream = &mut self.scratch;
        stream.reset(StreamMode::Checksum);
        let mut tick = frame.number();
        stream.serialize_i32(&mut tick)?;
        frame.serialize_players(stream)?;
        frame.serialize_state(stream)?;
        frame.serialize_assets(stream)?;
        Ok(stream.checksum_value())
    }

    /// Encode one block into the scratch stream and return its bytes.
    fn block(
        &mut self,
        frame: &mut Frame,
        walk: fn(&mut Frame, &mut BitStream) -> Result<(), StreamError>,
    ) -> Result<Vec<u8>, FrameError> {
        self.scratch.reset(StreamMode::Write);
        walk(frame, &mut self.scratch)?;
        Ok(self.scratch.bytes().to_vec())
    }

    /// Full-frame encoding, gzip-compressed.
    pub fn serialize(&mut self, frame: &mut Frame) -> Result<Vec<u8>, FrameError> {
        let checksum = self.checksum(frame)?;
        let mut players = self.block(frame, Frame::serialize_players)?;
        let mut state = self.block(frame, Frame::serialize_state)?;
        let mut assets = self.block(frame, Frame::serialize_assets)?;

        let mut out = BitStream::writer();
        let mut mode = FRAME_DATA_MODE_FULL;
        let mut tick = frame.number();
        let mut checksum_field = checksum;
        out.serialize_i32(&mut mode)?;
        out.serialize_i32(&mut tick)?;
        out.serialize_u64(&mut checksum_field)?;
        out.serialize_bytes(&mut players)?;
        out.serialize_bytes(&mut state)?;
        out.serialize_bytes(&mut assets)?;

        let raw = out.into_bytes();
        let compressed = gzip(&raw).map_err(|e| FrameError::Compression(e.to_string()))?;
        trace!(tick, raw = raw.len(), compressed = compressed.len(), "Serialized frame");
        Ok(compressed)
    }

    /// Restore a frame from [`serialize`](Self::serialize) output and verify
    /// its checksum. Returns the restored tick.
    pub fn deserialize(&mut self, frame: &mut Frame, data: &[u8]) -> Result<Tick, FrameError> {
        let raw = gunzip(data).map_err(|e| FrameError::Compression(e.to_string()))?;
        let mut header = BitStream::reader(raw);

        let mut mode = 0;
        header.serialize_i32(&mut mode)?;
        if mode != FRAME_DATA_MODE_FULL {
            return Err(FrameError::UnsupportedMode(mode));
        }
        let mut tick: Tick = 0;
        let mut expected = 0u64;
        header.serialize_i32(&mut tick)?;
        header.serialize_u64(&mut expected)?;

        let mut players = Vec::new();
        let mut state = Vec::new();
        let mut assets = Vec::new();
        header.serialize_bytes(&mut players)?;
        header.serialize_bytes(&mut state)?;
        header.serialize_bytes(&mut assets)?;
        if header.remaining() != 0 {
            return Err(StreamError::Invalid(format!("{} trailing bytes after frame", header.remaining())).into());
        }

        self.read_block(frame, &players, Frame::serialize_players)?;
        self.read_block(frame, &state, Frame::serialize_state)?;
        self.read_block(frame, &assets, Frame::serialize_assets)?;
        frame.set_number(tick);

        let actual = self.checksum(frame)?;
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }
        Ok(tick)
    }

    fn read_block(
        &mut self,
        frame: &mut Frame,
        bytes: &[u8],
        walk: fn(&mut Frame, &mut BitStream) -> Result<(), StreamError>,
    ) -> Result<(), FrameError> {
        self.scratch.reset_reader(bytes);
        walk(frame, &mut self.scratch)?;
        if self.scratch.remaining() != 0 {
            return Err(StreamError::Invalid(format!("{} trailing bytes in block", self.scratch.remaining())).into());
        }
        Ok(())
    }
}
