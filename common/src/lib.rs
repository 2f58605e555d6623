pub mod config;
pub mod forms;
pub mod frame;
pub mod scheduler;
pub mod topics;
pub mod types;

pub use config::DeviceConfig;
pub use forms::{parse_form, FormDecodeError};
pub use scheduler::{ConnectPoller, ConnectProgress, LinkScheduler, NodeRole, SchedulerAction};
pub use topics::*;
pub use types::{BusStatus, LinkMode, RxStatusPayload, RxTelemetry, TxStatusPayload, TxTelemetry};
