use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{error, trace};
use crate::error::TransportError;

pub const START_DATA: &[u8; 7] = b"FLT2002";
pub const END_DATA: &[u8; 7] = b"TLF2003";

/// start marker + payload length (u32 BE)
pub const HEADER_LEN: usize = START_DATA.len() + 4;
pub const FRAME_OVERHEAD: usize = HEADER_LEN + END_DATA.len();

/// Accumulates bytes as they arrive from a socket, in chunks of arbitrary size, and hands out
///  the payloads of complete frames. A trailing partial frame stays in the buffer until the rest
///  of it is appended.
///
/// Corrupt framing (a missing start marker, a length above the configured maximum or a missing
///  end marker) is reported as `TransportError::Framing` once it reaches the head of the buffer,
///  and then discards all buffered data: there is no way to resynchronise with the stream after
///  that, so the connection should be closed. Complete frames in front of the corruption are
///  counted and can be extracted first.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_payload_len: usize,
}

impl FrameBuffer {
    pub fn new(max_payload_len: usize) -> FrameBuffer {
        Self::with_capacity(1024, max_payload_len)
    }

    pub fn with_capacity(capacity: usize, max_payload_len: usize) -> FrameBuffer {
        FrameBuffer {
            buf: BytesMut::with_capacity(capacity),
            max_payload_len,
        }
    }

    pub fn data_package_len(payload_len: usize) -> usize {
        FRAME_OVERHEAD + payload_len
    }

    pub fn create_data_package(payload: &[u8]) -> Result<BytesMut, TransportError> {
        let mut buf = BytesMut::with_capacity(Self::data_package_len(payload.len()));
        Self::create_data_package_into(payload, &mut buf)?;
        Ok(buf)
    }

    pub fn create_data_package_into(payload: &[u8], buf: &mut impl BufMut) -> Result<(), TransportError> {
        let len = u32::try_from(payload.len())
            .map_err(|_| TransportError::framing(format!("payload of {} bytes does not fit into a frame", payload.len())))?;

        buf.put_slice(START_DATA);
        buf.put_u32(len);
        buf.put_slice(payload);
        buf.put_slice(END_DATA);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Returns the number of complete frames in the buffer after appending `data` if `count` is
    ///  true, and 0 otherwise (saving the scan).
    pub fn append(&mut self, data: &[u8], count: bool) -> Result<usize, TransportError> {
        self.buf.extend_from_slice(data);
        trace!("appended {} bytes, {} bytes buffered", data.len(), self.buf.len());

        if count {
            self.count_packages()
        }
        else {
            self.head_frame().map(|_| 0)
        }
    }

    pub fn count_packages(&mut self) -> Result<usize, TransportError> {
        self.scan(false)
    }

    pub fn does_package_exist(&mut self) -> Result<bool, TransportError> {
        Ok(self.scan(true)? > 0)
    }

    /// Returns the oldest complete payload. With `clear`, the frame is removed from the buffer,
    ///  otherwise this is a peek that leaves the buffer unchanged.
    pub fn extract_data_package(&mut self, clear: bool) -> Result<Bytes, TransportError> {
        let payload_len = match self.head_frame()? {
            Some(len) => len,
            None => return Err(TransportError::framing("no complete package in buffer")),
        };

        if clear {
            let mut frame = self.buf.split_to(Self::data_package_len(payload_len));
            frame.advance(HEADER_LEN);
            frame.truncate(payload_len);
            Ok(frame.freeze())
        }
        else {
            Ok(Bytes::copy_from_slice(&self.buf[HEADER_LEN..HEADER_LEN+payload_len]))
        }
    }

    /// Corruption at the head of the buffer is an error, corruption further back only ends the
    ///  count.
    fn scan(&mut self, first_only: bool) -> Result<usize, TransportError> {
        let Some(first_len) = self.head_frame()? else {
            return Ok(0);
        };
        if first_only {
            return Ok(1);
        }

        let mut count = 1;
        let mut offset = Self::data_package_len(first_len);
        while let Ok(Some(payload_len)) = self.check_frame_at(offset) {
            count += 1;
            offset += Self::data_package_len(payload_len);
        }
        Ok(count)
    }

    /// Checks the frame at the head of the buffer, returning its payload length if it is
    ///  complete and `None` if more data is needed.
    fn head_frame(&mut self) -> Result<Option<usize>, TransportError> {
        match self.check_frame_at(0) {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("discarding {} buffered bytes: {}", self.buf.len(), e);
                self.buf.clear();
                Err(e)
            }
        }
    }

    fn check_frame_at(&self, offset: usize) -> Result<Option<usize>, TransportError> {
        let available = &self.buf[offset..];

        let marker_len = available.len().min(START_DATA.len());
        if available[..marker_len] != START_DATA[..marker_len] {
            return Err(TransportError::framing("frame does not start with the start marker"));
        }
        if available.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut len_buf = &available[START_DATA.len()..HEADER_LEN];
        let payload_len = len_buf.get_u32() as usize;
        if payload_len > self.max_payload_len {
            return Err(TransportError::framing(format!("frame announces {} bytes, maximum is {}", payload_len, self.max_payload_len)));
        }

        let frame_len = Self::data_package_len(payload_len);
        if available.len() < frame_len {
            return Ok(None);
        }
        if &available[frame_len - END_DATA.len()..frame_len] != END_DATA.as_slice() {
            return Err(TransportError::framing("frame does not end with the end marker"));
        }
        Ok(Some(payload_len))
    }
}
