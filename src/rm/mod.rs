//! Resource manager: the node pool and the selection protocol that matches
//! tasks to FREE nodes.

pub mod node;
pub mod selection;

pub use node::{LocalNodeClient, NodeClient, NodeState, RmNode};
pub use selection::{NodeSet, ResourceSelector, SelectionPolicy};
