pub mod message_reader;
pub mod tcp_receiver;
pub mod worker_pool;
