use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use anyhow::bail;
use transport::config::TransportConfig;
use transport::member::Member;

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub transport: TransportConfig,

    /// Distinguishes this incarnation of the node from earlier ones on the same address
    pub local_unique: u64,
    /// The address peers use to reach this node. If this is `None`, the receiver's bound address
    ///  is used - which does not work for a wildcard bind address.
    pub public_host: Option<IpAddr>,

    /// How often pooled connections are checked against the keep-alive limits
    pub keep_alive_check_interval: Duration,
}

impl ClusterConfig {
    pub fn new(bind_addr: SocketAddr) -> anyhow::Result<ClusterConfig> {
        Ok(ClusterConfig {
            transport: TransportConfig::new(bind_addr),
            local_unique: Member::unique_from_clock()?,
            public_host: None,
            keep_alive_check_interval: Duration::from_secs(5),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport.validate()?;
        if self.keep_alive_check_interval.is_zero() {
            bail!("keep-alive check interval must not be zero");
        }
        Ok(())
    }

    /// The member identity this node announces, given the address its receiver is bound to
    pub fn local_member(&self, bound_addr: SocketAddr) -> Member {
        let host = self.public_host
            .unwrap_or(bound_addr.ip());
        Member::new(self.local_unique, SocketAddr::new(host, bound_addr.port()))
    }
}
