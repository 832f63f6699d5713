/*
[INPUT]:  Wire protocol and REST schema definitions
[OUTPUT]: Typed Rust structs/enums with serialization support
[POS]:    Data layer - type definitions shared by ws and http layers
[UPDATE]: When schema changes or new types added
*/

pub mod enums;
pub mod models;

pub use enums::*;
pub use models::*;
