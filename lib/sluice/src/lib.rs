//! `sluice` hosts directed graphs of sequential processes ("nodes") linked by
//! bounded FIFO byte queues, locally or spanned across machines. Kernels
//! supervise the nodes and queues of one process, a context names everything
//! across the cluster, and a framed stream protocol makes a cross-machine
//! queue indistinguishable from a local one.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod attr;
pub mod context;
pub mod d4r;
pub mod error;
pub mod factory;
pub mod identity;
pub mod kernel;
pub mod loader;
pub mod net;
pub mod node;
pub mod queue;

pub mod prelude;
