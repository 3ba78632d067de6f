pub mod data_sender;
pub mod sender_pool;
pub mod sender_state;
pub mod tcp_sender;
pub mod transmitter;
