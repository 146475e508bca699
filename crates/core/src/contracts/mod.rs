pub mod tree_registry;
