pub mod atomic_map;
pub mod frame_buffer;
