pub mod components;

pub use components::{
    decide_settlement, ConsumerSettings, ConsumerStats, ConsumerStatsSnapshot, ConsumptionLoop,
    Deliverer, DeliveryExecutor, DispatchLifecycle, RedeliveryTracker, Settlement,
};
