pub mod io;

mod handle;
mod store;

pub use handle::StoreHandle;
pub use store::{GaussianStore, MAX_SH_DEGREE};
