use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Managed,
    Local,
}

impl LinkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Managed => "MANAGED",
            Self::Local => "LOCAL",
        }
    }
}

/// Outcome of the most recent bus exchange. The sending role reports
/// `Idle`/`Ok`; the receiving role reports `Idle`/`Data`/`Empty`. Either
/// role reports `Fail` when the driver could not clock the exchange at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Idle,
    Ok,
    Data,
    Empty,
    Fail,
}

impl BusStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Ok => "OK",
            Self::Data => "DATA",
            Self::Empty => "EMPTY",
            Self::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TxStatusPayload {
    pub tx: u64,
    pub spi: &'static str,
    pub rssi: i32,
    pub mqtt: bool,
    pub uptime: u64,
    pub heap: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct RxStatusPayload {
    pub rx: u64,
    pub spi: &'static str,
    pub hex: String,
    pub ascii: String,
    pub rssi: i32,
    pub mqtt: bool,
    pub uptime: u64,
    pub heap: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct TxTelemetry {
    pub tx: u64,
    pub msg: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RxTelemetry {
    pub rx: u64,
    pub hex: String,
    pub ascii: String,
}
