pub mod closure;
pub mod ids;
pub mod money;
pub mod payment;

pub use closure::{ClientClosureAction, ClosureNotes, ClosureState, ProviderClosureAction};
pub use ids::{
    AppointmentId, ClientId, DebtId, PaymentId, ProviderId, RequestId, TraceId, TransactionId,
};
pub use money::{Amount, MoneyError};
pub use payment::{
    AppointmentStatus, DebtStatus, PaymentMethod, PaymentStatus, ReleaseStatus, TransactionKind,
};
