//! Stream transport between kernels: buffered byte queues over TCP, the
//! frame codec, and the per-kernel multiplexing hub.

pub mod buffer;
pub mod frame;
pub(crate) mod hub;
