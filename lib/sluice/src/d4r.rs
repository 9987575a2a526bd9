//! Distributed deadlock detection and relief. Every node carries a public
//! tag `(count, node, queue_size, queue)`; blocking on a queue stamps the tag
//! onto that queue so the peer node learns about it, and blocked nodes
//! forward the largest tag they have seen onto the queue they themselves
//! block on. A tag returning to its owner proves a cycle; the owner relieves
//! it by growing the queue it blocks on. Tag order is lexicographic, so the
//! node holding the largest tag in a cycle is the unique one that sees its
//! own tag echoed.
//!
//! Tags cross kernel boundaries inside the control frames of the stream
//! protocol; nothing here talks to the network directly.

use crate::identity::NodeKey;
use crate::queue::QueueCore;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use weir::logging::{self, Logger};

/// Block-event tag. Ordered lexicographically; `(count, node)` alone is
/// unique because a node mints one tag per block event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Tag {
    pub count: u64,
    pub node: u64,
    pub queue_size: u64,
    pub queue: u64,
}

impl Tag {
    pub const NONE: Tag = Tag {
        count: 0,
        node: 0,
        queue_size: 0,
        queue: 0,
    };

    #[inline]
    pub fn is_none(&self) -> bool {
        self.node == 0
    }
}

impl Ord for Tag {
    #[inline]
    fn cmp(&self, other: &Tag) -> Ordering {
        (self.count, self.node, self.queue_size, self.queue).cmp(&(
            other.count,
            other.node,
            other.queue_size,
            other.queue,
        ))
    }
}

impl PartialOrd for Tag {
    #[inline]
    fn partial_cmp(&self, other: &Tag) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One side of a queue as seen by the detector: where a blocked node stamps
/// its tag and what gets grown when that node wins relief.
#[derive(Clone)]
pub(crate) struct Site {
    pub core: Arc<QueueCore>,
    pub writer: bool,
}

impl Site {
    /// Store the tag on our side of the queue and hand back the local peer
    /// node, if any, so propagation can continue in-process. For distributed
    /// queues the tag rides the next control frame instead.
    fn stamp_forward(&self, tag: Tag) -> Option<Arc<D4rNode>> {
        self.core.stamp_tag(self.writer, tag)
    }

    fn relieve(&self) {
        self.core.relieve(self.writer);
    }
}

enum Action {
    Stop,
    Relieve(Site),
    Forward(Site, Tag),
}

struct D4rState {
    count: u64,
    public: Tag,
    incoming: Tag,
    blocked: Option<Site>,
}

/// Detector state attached to one node.
pub struct D4rNode {
    key: NodeKey,
    enabled: bool,
    state: Mutex<D4rState>,
    log: Logger,
}

impl D4rNode {
    pub(crate) fn new<'a, L: Into<Option<&'a Logger>>>(key: NodeKey, enabled: bool, log: L) -> Arc<D4rNode> {
        Arc::new(D4rNode {
            key,
            enabled,
            state: Mutex::new(D4rState {
                count: 0,
                public: Tag::NONE,
                incoming: Tag::NONE,
                blocked: None,
            }),
            log: logging::component(log),
        })
    }

    #[inline]
    pub(crate) fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record a fresh block event on `site`. Returns the public tag to stamp
    /// onto the queue, or `None` when the detector is disabled.
    ///
    /// The caller supplies the queue identity and size it already read under
    /// the queue lock; this function takes only the node's own lock.
    pub(crate) fn on_block(&self, site: Site, queue_key: u64, queue_size: u64) -> Option<Tag> {
        if !self.enabled {
            return None;
        }

        let mut state = self.state.lock().unwrap();

        state.count += 1;
        let own = Tag {
            count: state.count,
            node: self.key.raw(),
            queue_size,
            queue: queue_key,
        };

        state.public = own.max(state.incoming);
        state.blocked = Some(site);

        logging::trace!(self.log, "node blocked";
                        "node" => %self.key,
                        "block_count" => state.count,
                        "queue" => queue_key);

        Some(state.public)
    }

    /// The blocked operation completed; clear propagation state.
    pub(crate) fn on_unblock(&self) {
        if !self.enabled {
            return;
        }

        let mut state = self.state.lock().unwrap();
        state.blocked = None;
        state.incoming = Tag::NONE;
        state.public = Tag::NONE;
    }

    fn apply_incoming(&self, tag: Tag) -> Action {
        if !self.enabled || tag.is_none() {
            return Action::Stop;
        }

        let mut state = self.state.lock().unwrap();

        if tag <= state.incoming {
            return Action::Stop;
        }
        state.incoming = tag;

        let site = match &state.blocked {
            Some(site) => site.clone(),
            None => return Action::Stop,
        };

        // Our own tag came back around: this node holds the cycle's largest
        // tag and performs the relief.
        if tag.node == self.key.raw() && tag.count == state.count {
            logging::debug!(self.log, "deadlock cycle detected";
                            "node" => %self.key,
                            "block_count" => state.count,
                            "queue" => tag.queue);
            return Action::Relieve(site);
        }

        let public = state.public.max(state.incoming);
        if public > state.public {
            state.public = public;
            return Action::Forward(site, public);
        }

        Action::Stop
    }
}

/// Deliver a propagated tag to `node`, chasing the propagation chain across
/// any further blocked nodes in this process. Locks are taken one at a time;
/// the chain terminates because tags only ever grow along it.
pub(crate) fn deliver(node: &Arc<D4rNode>, tag: Tag) {
    let mut node = node.clone();
    let mut tag = tag;

    loop {
        match node.apply_incoming(tag) {
            Action::Stop => return,
            Action::Relieve(site) => {
                site.relieve();
                return;
            }
            Action::Forward(site, forwarded) => match site.stamp_forward(forwarded) {
                Some(peer) => {
                    node = peer;
                    tag = forwarded;
                }
                None => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_order_lexicographic() {
        let low = Tag {
            count: 1,
            node: 9,
            queue_size: 0,
            queue: 0,
        };
        let high = Tag {
            count: 2,
            node: 1,
            queue_size: 0,
            queue: 0,
        };

        assert!(high > low);
        assert!(low > Tag::NONE);

        let same_count = Tag {
            count: 2,
            node: 3,
            queue_size: 0,
            queue: 0,
        };
        assert!(same_count > high);
    }

    #[test]
    fn test_disabled_node_mints_no_tags() {
        let node = D4rNode::new(NodeKey(5), false, None);
        assert!(!node.enabled());

        let site_core = crate::queue::testing::standalone_core(16);
        let tag = node.on_block(
            Site {
                core: site_core,
                writer: true,
            },
            1,
            16,
        );

        assert!(tag.is_none());
        assert_eq!(node.state.lock().unwrap().count, 0);
    }

    #[test]
    fn test_block_bumps_count_and_takes_max() {
        let node = D4rNode::new(NodeKey(5), true, None);

        // Pre-load an incoming tag larger than anything the node will mint.
        {
            let mut state = node.state.lock().unwrap();
            state.incoming = Tag {
                count: 100,
                node: 2,
                queue_size: 1,
                queue: 7,
            };
        }

        let site_core = crate::queue::testing::standalone_core(16);
        let tag = node
            .on_block(
                Site {
                    core: site_core,
                    writer: true,
                },
                7,
                16,
            )
            .unwrap();

        // The public tag is the incoming maximum, not the node's own.
        assert_eq!(tag.count, 100);
        assert_eq!(tag.node, 2);
    }

    #[test]
    fn test_unblock_resets() {
        let node = D4rNode::new(NodeKey(5), true, None);
        let site_core = crate::queue::testing::standalone_core(16);

        node.on_block(
            Site {
                core: site_core,
                writer: true,
            },
            1,
            16,
        )
        .unwrap();
        node.on_unblock();

        let state = node.state.lock().unwrap();
        assert!(state.blocked.is_none());
        assert_eq!(state.incoming, Tag::NONE);
        assert_eq!(state.public, Tag::NONE);
        assert_eq!(state.count, 1);
    }

    #[test]
    fn test_echo_detection() {
        let node = D4rNode::new(NodeKey(5), true, None);
        let site_core = crate::queue::testing::standalone_core(16);

        let own = node
            .on_block(
                Site {
                    core: site_core,
                    writer: true,
                },
                1,
                16,
            )
            .unwrap();

        match node.apply_incoming(own) {
            Action::Relieve(_) => (),
            _ => panic!("own tag echo must trigger relief"),
        }
    }

    #[test]
    fn test_foreign_tag_forwards() {
        let node = D4rNode::new(NodeKey(5), true, None);
        let site_core = crate::queue::testing::standalone_core(16);

        node.on_block(
            Site {
                core: site_core,
                writer: true,
            },
            1,
            16,
        )
        .unwrap();

        let foreign = Tag {
            count: 50,
            node: 9,
            queue_size: 4,
            queue: 3,
        };

        match node.apply_incoming(foreign) {
            Action::Forward(_, tag) => assert_eq!(tag, foreign),
            _ => panic!("larger foreign tag must forward"),
        }

        // Re-delivery of the same tag stops immediately.
        match node.apply_incoming(foreign) {
            Action::Stop => (),
            _ => panic!("duplicate tag must stop"),
        }
    }
}
