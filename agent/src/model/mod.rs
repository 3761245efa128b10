mod store;

pub use store::{LoadOutcome, ModelStats, ModelStore, ResidentModel, StoreError};
