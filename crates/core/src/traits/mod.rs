pub mod data_store;
pub mod runnable;

pub use data_store::*;
pub use runnable::*;
