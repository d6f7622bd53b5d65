//! Flash sale ("seckill")
//!
//! - [`AdmissionGate`]: the indivisible check-and-reserve for one purchase
//! - [`CouponAdmin`]: coupon publication and restock
//! - [`OrderPipeline`]: workers turning admitted purchases into orders

pub mod admin;
pub mod gate;
pub mod pipeline;

pub use admin::CouponAdmin;
pub use gate::AdmissionGate;
pub use pipeline::{OrderPipeline, QueueAdmin, WorkerConfig};

/// Definitive answer to a purchase attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Stock reserved and order queued; `token` identifies the queue entry
    Admitted { token: String },
    SoldOut,
    NotYetOpen,
    Closed,
    Duplicate,
    /// The coupon does not exist
    NotFound,
}

impl AdmissionOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionOutcome::Admitted { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOutcome::Admitted { .. } => "admitted",
            AdmissionOutcome::SoldOut => "sold-out",
            AdmissionOutcome::NotYetOpen => "not-open",
            AdmissionOutcome::Closed => "closed",
            AdmissionOutcome::Duplicate => "duplicate",
            AdmissionOutcome::NotFound => "not-found",
        }
    }
}
