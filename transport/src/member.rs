use anyhow::bail;
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use bytes::{Buf, BufMut};


/// The identity of a cluster node as far as the transport is concerned: the address its receiver
///  listens on, plus a 'unique' part to tell apart successive incarnations of a node that restarts
///  on the same address (initialized from the clock by default).
///
/// Members are advertised by the membership layer and never change afterwards. The transport
///  uses them as keys for sender pools and sender state only.
///
/// Encoded form (BE):
///
/// ```ascii
///  0: unique (48 bits)
///  6: port (u16)
///  8: host length (u8) - 4 for IPv4, 16 for IPv6
///  9: host address
/// ```
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Member {
    unique: u64,
    pub socket_addr: SocketAddr,
}

impl Debug for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.socket_addr, self.unique)
    }
}

impl Display for Member {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.socket_addr)
    }
}

impl Member {
    /// `unique` has 48 significant bits, which is plenty for millis since epoch
    pub const UNIQUE_MASK: u64 = 0xffff_ffff_ffff;
    const UNIQUE_LEN: usize = 6;

    pub fn new(unique: u64, socket_addr: SocketAddr) -> Member {
        Member {
            unique: unique & Self::UNIQUE_MASK,
            socket_addr,
        }
    }

    pub fn unique(&self) -> u64 {
        self.unique
    }

    /// millis since epoch - different and bigger after a restart of the node
    pub fn unique_from_clock() -> anyhow::Result<u64> {
        let raw = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_millis();

        if raw > Self::UNIQUE_MASK as u128 {
            bail!("system clock is in the future");
        }
        Ok(raw as u64)
    }

    /// unique, port, host length
    fn encoded_len(host_len: usize) -> usize {
        Self::UNIQUE_LEN + 2 + 1 + host_len
    }

    pub fn serialized_len(&self) -> usize {
        Self::encoded_len(if self.socket_addr.is_ipv4() { 4 } else { 16 })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_uint(self.unique, Self::UNIQUE_LEN);
        buf.put_u16(self.socket_addr.port());
        match self.socket_addr.ip() {
            IpAddr::V4(ip) => put_host(buf, &ip.octets()),
            IpAddr::V6(ip) => put_host(buf, &ip.octets()),
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Member> {
        if buf.remaining() < Self::encoded_len(0) {
            bail!("member needs at least {} bytes, only {} remain", Self::encoded_len(0), buf.remaining());
        }
        let unique = buf.get_uint(Self::UNIQUE_LEN);
        let port = buf.get_u16();
        let host_len = buf.get_u8() as usize;

        if buf.remaining() < host_len {
            bail!("member announces a host of {} bytes, only {} remain", host_len, buf.remaining());
        }
        let host = match host_len {
            4 => IpAddr::from(take_host::<4>(buf)),
            16 => IpAddr::from(take_host::<16>(buf)),
            n => bail!("unsupported host address length: {}", n),
        };
        Ok(Member::new(unique, SocketAddr::new(host, port)))
    }
}

fn put_host(buf: &mut impl BufMut, octets: &[u8]) {
    buf.put_u8(octets.len() as u8);
    buf.put_slice(octets);
}

fn take_host<const N: usize>(buf: &mut impl Buf) -> [u8; N] {
    let mut octets = [0u8; N];
    buf.copy_to_slice(&mut octets);
    octets
}
