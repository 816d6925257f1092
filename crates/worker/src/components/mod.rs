pub mod consumption_loop;
pub mod delivery_executor;
pub mod dispatch_lifecycle;

pub use consumption_loop::{
    decide_settlement, ConsumerSettings, ConsumerStats, ConsumerStatsSnapshot, ConsumptionLoop,
    RedeliveryTracker, Settlement,
};
pub use delivery_executor::{classify, classify_error, Deliverer, DeliveryExecutor};
pub use dispatch_lifecycle::DispatchLifecycle;
