pub use crate::{
    error::{Corruption, Error},
    key::StorageKey,
    store::{SidecarStore, StoreOccupancy},
};

mod error;
mod key;
mod store;
