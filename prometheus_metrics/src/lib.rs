pub use crate::{
    helpers::{stop_and_discard, stop_and_record},
    metrics::{Metrics, METRICS},
};

mod helpers;
mod metrics;
