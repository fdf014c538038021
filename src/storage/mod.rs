pub mod codec;
pub mod engine;
pub mod existence;
pub mod file_engine;
pub mod file_lock;
pub mod keys;
pub mod log;
pub mod memory;
pub mod segment_size;
