mod counted_set;
mod immutable_tree;

pub use counted_set::CountedSet;
pub use immutable_tree::ImmutableTree;
