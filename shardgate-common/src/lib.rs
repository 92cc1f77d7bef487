pub mod backend;
pub mod chunk;
pub mod placement;
pub mod records;
