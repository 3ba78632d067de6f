use tracing::trace;
use crate::buffers::frame_buffer::FrameBuffer;
use crate::channel_message::ChannelMessage;
use crate::error::TransportError;

/// Per-connection receive state: buffers raw bytes and turns complete frames into messages.
///  A reader belongs to exactly one accepted connection and is dropped with it.
pub struct MessageReader {
    buffer: FrameBuffer,
}

impl MessageReader {
    pub fn new(max_message_size: usize, initial_capacity: usize) -> MessageReader {
        MessageReader {
            buffer: FrameBuffer::with_capacity(initial_capacity, max_message_size),
        }
    }

    /// Appends bytes read from the connection, returning the number of complete frames that are
    ///  now buffered.
    pub fn append(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.buffer.append(data, true)
    }

    /// Takes all complete frames out of the buffer and decodes them, in the order they were
    ///  received. Bytes of an incomplete trailing frame stay buffered.
    ///
    /// Decoding stops at the first corrupt frame or undecodable message. The messages decoded
    ///  before that are returned together with the error, and the connection should be closed
    ///  after processing them.
    pub fn execute(&mut self) -> (Vec<ChannelMessage>, Result<(), TransportError>) {
        let mut result = Vec::new();
        let outcome = self.decode_into(&mut result);
        if outcome.is_err() {
            self.buffer.reset();
        }
        (result, outcome)
    }

    fn decode_into(&mut self, result: &mut Vec<ChannelMessage>) -> Result<(), TransportError> {
        while self.buffer.does_package_exist()? {
            let mut payload = self.buffer.extract_data_package(true)?;
            let msg = ChannelMessage::try_deser(&mut payload)
                .map_err(|e| TransportError::framing(format!("unable to decode message: {}", e)))?;
            trace!("decoded message {}", msg.unique_id);
            result.push(msg);
        }
        Ok(())
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
