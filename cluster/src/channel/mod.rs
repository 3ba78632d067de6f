pub mod channel_listener;
pub mod replication_channel;
