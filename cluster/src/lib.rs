//! Replication channel on top of the `transport` crate: the API that session replication and
//!  other cluster services use to send messages to their peers and to receive them.

pub mod channel;
pub mod cluster_config;

#[cfg(test)]
mod test_util;
