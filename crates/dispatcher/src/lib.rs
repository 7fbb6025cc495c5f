pub mod dispatcher;
pub mod machine_pool;
pub mod power;
pub mod recovery_sweep;
pub mod result_collector;

pub use dispatcher::{DispatchReport, JobDispatcher};
pub use machine_pool::{HostHealth, MachinePool};
pub use power::{CommandPowerControl, PowerControl};
pub use recovery_sweep::RecoverySweep;
pub use result_collector::{CollectReport, ResultCollector};
