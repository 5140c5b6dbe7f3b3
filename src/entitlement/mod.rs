pub mod adapters;
pub mod admin;
pub mod api;
pub mod catalog;
pub mod counter;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod subscriptions;

pub use adapters::{BillingProviderAdapter, PaymentEvent, StripeLikeAdapter};
pub use admin::{AdminOverrideService, AdminSubscriptionRow, Page, SubscriptionFilter};
pub use catalog::{PlanCatalog, PlanPatch, PlanSpec};
pub use counter::UsageCounter;
pub use models::{
    ConsumeDecision, ConsumeOutcome, EntitlementStatus, Plan, PlanFeatures, SubscribeOutcome,
    Subscription, SubscriptionStatus, UsageRecord, UsageSummary, FREE_PLAN_NAME,
};
pub use service::EntitlementService;
pub use subscriptions::SubscriptionStore;
