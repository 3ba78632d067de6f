pub const ACK_LEN: usize = 3;

/// Sent by the receiver when a message was received (and, for sync acks, processed) successfully
pub const ACK: [u8; ACK_LEN] = [6, 2, 3];

/// Sent by the receiver when the application callback failed to process a message that was
///  sent with sync ack
pub const FAIL_ACK: [u8; ACK_LEN] = [11, 0, 5];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AckKind {
    Ack,
    FailAck,
}

impl AckKind {
    /// Returns `None` for anything that is not exactly one of the two ack sequences - this
    ///  includes truncated input.
    pub fn parse(buf: &[u8]) -> Option<AckKind> {
        if buf == ACK {
            Some(AckKind::Ack)
        }
        else if buf == FAIL_ACK {
            Some(AckKind::FailAck)
        }
        else {
            None
        }
    }

    pub fn bytes(self) -> &'static [u8; ACK_LEN] {
        match self {
            AckKind::Ack => &ACK,
            AckKind::FailAck => &FAIL_ACK,
        }
    }

    pub fn from_success(success: bool) -> AckKind {
        if success { AckKind::Ack } else { AckKind::FailAck }
    }
}
