mod index;
mod node;

pub use index::{name_compare, Index, NamedNode, MAX_NAME, MIN_NAME};
pub use node::{LeafValue, Node};
