use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use crate::member::Member;

/// Everything that can go wrong in the transport. Raw `io::Error`s are wrapped with the address
///  they refer to and never leak from the sender / receiver API on their own.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unable to bind receiver to {addr}: {source}")]
    Bind { addr: SocketAddr, #[source] source: io::Error },

    #[error("unable to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, #[source] source: io::Error },

    #[error("I/O error on connection to {addr}: {source}")]
    Io { addr: SocketAddr, #[source] source: io::Error },

    #[error("no progress on connection to {addr} within {timeout:?}")]
    Timeout { addr: SocketAddr, timeout: Duration },

    #[error("not connected to {addr}")]
    NotConnected { addr: SocketAddr },

    /// Malformed frames, unparsable messages, and acks that are neither ACK nor FAIL_ACK
    #[error("framing error: {0}")]
    Framing(String),

    /// The peer received the message but its application callback failed to process it
    #[error("{addr} received the message but failed to process it")]
    RemoteProcessing { addr: SocketAddr },

    #[error("no sender for {member:?} became available within {waited:?}")]
    PoolExhausted { member: Member, waited: Duration },

    #[error("{0:?} disappeared from the cluster")]
    MemberDisappeared(Member),

    #[error("sending to {addr} failed after {attempts} attempts: {source}")]
    RetriesExhausted { addr: SocketAddr, attempts: u32, #[source] source: Box<TransportError> },
}

impl TransportError {
    pub fn framing(msg: impl Into<String>) -> TransportError {
        TransportError::Framing(msg.into())
    }

    /// Errors for which closing the connection and trying again on a fresh one may help
    pub fn is_retryable(&self) -> bool {
        matches!(self,
            TransportError::Connect { .. }
            | TransportError::Io { .. }
            | TransportError::Timeout { .. }
            | TransportError::NotConnected { .. }
            | TransportError::Framing(_)
        )
    }

    /// The root cause, looking through `RetriesExhausted`
    pub fn root(&self) -> &TransportError {
        match self {
            TransportError::RetriesExhausted { source, .. } => source.root(),
            e => e,
        }
    }
}

#[derive(Debug)]
pub struct FaultyMember {
    pub member: Member,
    pub error: TransportError,
}

/// The result of sending a message to several members: lists every member that did not get the
///  message, with the reason.
#[derive(Debug)]
pub struct ChannelError {
    message: String,
    faulty_members: Vec<FaultyMember>,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> ChannelError {
        ChannelError {
            message: message.into(),
            faulty_members: Vec::new(),
        }
    }

    pub fn add_faulty_member(&mut self, member: Member, error: TransportError) {
        self.faulty_members.push(FaultyMember { member, error });
    }

    pub fn faulty_members(&self) -> &[FaultyMember] {
        &self.faulty_members
    }

    pub fn faulty_member(&self, member: &Member) -> Option<&TransportError> {
        self.faulty_members.iter()
            .find(|f| &f.member == member)
            .map(|f| &f.error)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ChannelError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        for faulty in &self.faulty_members {
            write!(f, "; {:?}: {}", faulty.member, faulty.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelError {}
