//! Process-wide node factory registry. Kernels look factories up by the
//! string type name carried on a `NodeAttr`; factories are installed either
//! by explicit calls during startup or by link-time registrars via the
//! `register_node_type!` macro.

use crate::attr::NodeAttr;
use crate::node::Node;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

pub trait NodeFactory: Send + Sync {
    fn create(&self, attr: &NodeAttr) -> Box<dyn Node>;
}

/// Factory wrapping a plain constructor function.
pub struct FnFactory<F> {
    ctor: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&NodeAttr) -> Box<dyn Node> + Send + Sync,
{
    pub fn new(ctor: F) -> FnFactory<F> {
        FnFactory { ctor }
    }
}

impl<F> NodeFactory for FnFactory<F>
where
    F: Fn(&NodeAttr) -> Box<dyn Node> + Send + Sync,
{
    fn create(&self, attr: &NodeAttr) -> Box<dyn Node> {
        (self.ctor)(attr)
    }
}

lazy_static! {
    static ref FACTORIES: Mutex<HashMap<String, Arc<dyn NodeFactory>>> = Mutex::new(HashMap::new());
}

/// Install a factory under a type name; a later registration under the same
/// name replaces the earlier one.
pub fn register_node_factory<N: Into<String>>(name: N, factory: Arc<dyn NodeFactory>) {
    FACTORIES.lock().unwrap().insert(name.into(), factory);
}

pub fn node_factory(name: &str) -> Option<Arc<dyn NodeFactory>> {
    FACTORIES.lock().unwrap().get(name).cloned()
}

pub fn registered_types() -> Vec<String> {
    let mut names: Vec<String> = FACTORIES.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
}

/// Register a node type from a link-time initializer. The using crate needs
/// `ctor` in its dependencies:
///
/// ```ignore
/// register_node_type!(register_filter, "filter", |attr| {
///     Box::new(FilterNode::from_attr(attr))
/// });
/// ```
#[macro_export]
macro_rules! register_node_type {
    ($registrar: ident, $name: expr, $ctor: expr) => {
        #[ctor::ctor]
        fn $registrar() {
            $crate::factory::register_node_factory(
                $name,
                ::std::sync::Arc::new($crate::factory::FnFactory::new($ctor)),
            );
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FnNode, Node};

    fn noop(_attr: &NodeAttr) -> Box<dyn Node> {
        Box::new(FnNode::new(|_node| Ok(())))
    }

    #[test]
    fn test_register_and_lookup() {
        register_node_factory("factory-test-noop", Arc::new(FnFactory::new(noop)));

        assert!(node_factory("factory-test-noop").is_some());
        assert!(node_factory("factory-test-missing").is_none());
        assert!(registered_types().contains(&"factory-test-noop".to_string()));
    }

    #[test]
    fn test_factory_creates_nodes() {
        register_node_factory("factory-test-create", Arc::new(FnFactory::new(noop)));

        let attr = NodeAttr::new("n", "factory-test-create", "h");
        let _node = node_factory("factory-test-create").unwrap().create(&attr);
    }
}
