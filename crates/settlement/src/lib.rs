//! Payment settlement and closure engine: turns gateway events and cash
//! declarations into commission-split payment records, releases provider
//! funds behind a holdback-plus-verification double gate, and resolves cash
//! disputes through a two-party closure protocol.

mod cash;
mod closure;
mod earnings;
mod engine;
mod error;
mod escrow;
mod notify;
mod split;
mod verify;

pub use cash::{CashActor, CashSelection};
pub use closure::ClosureStatus;
pub use earnings::EarningsSummary;
pub use engine::{CashSettlement, GatewayRefs, SettlementEngine, SettlementStore};
pub use error::SettlementError;
pub use escrow::{spawn_release_sweep_loop, ReleaseOutcome, SweepReport};
pub use notify::{
    HttpNotificationSink, InMemoryNotificationSink, NoopNotificationSink, Notice,
    NotificationSink, NotifyTarget,
};
pub use split::{CommissionPolicy, PaymentSplit};
pub use verify::VerifyServiceOutcome;
