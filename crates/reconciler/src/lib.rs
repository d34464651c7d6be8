//! Payment side of the ledger: the provider client, per-payment watchers that
//! credit balances exactly once, and top-up initiation. Runs inside the
//! gateway process.

pub mod pipeline;
pub mod provider;
pub mod topup;
pub mod watcher;


pub use pipeline::{process_snapshot, Step};
pub use provider::{
    CreatedPayment, HttpPaymentProvider, PaymentProvider, PaymentRequest, PaymentSnapshot,
    ProviderError, ProviderStatus,
};
pub use topup::{ReconcileError, TopUp, TopUpService};
pub use watcher::{PaymentWatcher, WatchExit, WatchPolicy};
