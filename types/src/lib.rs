pub mod config;
pub mod consts;
pub mod containers;
pub mod primitives;
pub mod traits;
