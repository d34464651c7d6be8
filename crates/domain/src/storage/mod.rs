//! Storage traits implemented by the ledger backend.

mod traits;

pub use traits::*;
