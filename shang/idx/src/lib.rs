//! Typed indices and the arenas they key. Nodes, blocks and value links are
//! referred to by small `Copy` indices that stay valid while their arena
//! grows.
mod index_trait;
mod indexed_map;
mod macros;

pub mod maps {
    pub use super::indexed_map::IndexedMap;
}

pub use index_trait::IndexRef;
