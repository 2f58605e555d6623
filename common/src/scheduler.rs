//! Cooperative link scheduler.
//!
//! All five timed activities (telemetry reconnect, periodic bus exchange,
//! indicator pulse, local-mode safety window, and the one-time managed-link
//! wait) are expressed against an injected monotonic millisecond counter.
//! The scheduler never sleeps or blocks: each `tick` is a constant-work pass
//! that either emits an action or defers until a later invocation. The
//! platform layer (esp/host) executes the emitted actions in order and feeds
//! results back through `record_exchange` / `set_telemetry_connected`.

use crate::frame;
use crate::types::{BusStatus, LinkMode, RxStatusPayload, RxTelemetry, TxStatusPayload, TxTelemetry};

pub const EXCHANGE_INTERVAL_MS: u64 = 2_000;
pub const RECONNECT_INTERVAL_MS: u64 = 5_000;
pub const LOCAL_MODE_WINDOW_MS: u64 = 300_000;
pub const TX_INDICATOR_PULSE_MS: u64 = 50;
pub const RX_INDICATOR_PULSE_MS: u64 = 80;

pub const MANAGED_CONNECT_TIMEOUT_MS: u64 = 15_000;
pub const MANAGED_CONNECT_POLL_MS: u64 = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Tx,
    Rx,
}

impl NodeRole {
    pub fn indicator_pulse_ms(self) -> u64 {
        match self {
            Self::Tx => TX_INDICATOR_PULSE_MS,
            Self::Rx => RX_INDICATOR_PULSE_MS,
        }
    }

    pub fn out_frame(self) -> &'static [u8] {
        match self {
            Self::Tx => frame::TX_FRAME,
            Self::Rx => &frame::RX_OUT_FRAME,
        }
    }
}

/// One unit of work the platform layer must perform. Emitted in the fixed
/// per-invocation order: telemetry, bus exchange, indicator, safety restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Attempt a single (re)connect to the telemetry broker.
    ConnectTelemetry,
    /// Perform one chip-select-gated bus exchange and feed the response to
    /// [`LinkScheduler::record_exchange`].
    BusExchange,
    /// Fire-and-forget publish of `payload` to the configured topic.
    Publish(String),
    IndicatorOn,
    IndicatorOff,
    /// Local mode exceeded its safety window; perform a full restart.
    Restart,
}

#[derive(Debug)]
pub struct LinkScheduler {
    role: NodeRole,

    link_mode: LinkMode,
    local_mode_since_ms: Option<u64>,

    telemetry_enabled: bool,
    telemetry_connected: bool,
    last_connect_attempt_ms: Option<u64>,

    last_exchange_ms: Option<u64>,
    exchange_count: u64,
    bus_status: BusStatus,
    rx_payload: Vec<u8>,
    rx_hex: String,
    rx_ascii: String,

    indicator_on: bool,
    indicator_off_ms: u64,
}

impl LinkScheduler {
    pub fn new(role: NodeRole) -> Self {
        Self {
            role,
            link_mode: LinkMode::Managed,
            local_mode_since_ms: None,
            telemetry_enabled: false,
            telemetry_connected: false,
            last_connect_attempt_ms: None,
            last_exchange_ms: None,
            exchange_count: 0,
            bus_status: BusStatus::Idle,
            rx_payload: Vec::new(),
            rx_hex: String::new(),
            rx_ascii: String::new(),
            indicator_on: false,
            indicator_off_ms: 0,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn link_mode(&self) -> LinkMode {
        self.link_mode
    }

    pub fn set_link_mode(&mut self, mode: LinkMode, now_ms: u64) {
        self.link_mode = mode;
        self.local_mode_since_ms = match mode {
            LinkMode::Local => Some(now_ms),
            LinkMode::Managed => None,
        };
    }

    pub fn set_telemetry_enabled(&mut self, enabled: bool) {
        self.telemetry_enabled = enabled;
    }

    pub fn set_telemetry_connected(&mut self, connected: bool) {
        self.telemetry_connected = connected;
    }

    pub fn telemetry_connected(&self) -> bool {
        self.telemetry_connected
    }

    pub fn exchange_count(&self) -> u64 {
        self.exchange_count
    }

    pub fn bus_status(&self) -> BusStatus {
        self.bus_status
    }

    pub fn indicator_is_on(&self) -> bool {
        self.indicator_on
    }

    pub fn rx_payload(&self) -> &[u8] {
        &self.rx_payload
    }

    /// One scheduler invocation: a constant-work pass over every activity.
    /// Evaluation order is fixed. When an exchange is due in the same pass,
    /// the indicator deadline is left for the next invocation: the platform
    /// performs the exchange after this tick returns, and a pulse the
    /// exchange re-arms must not be killed by an off emitted beforehand.
    pub fn tick(&mut self, now_ms: u64) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();

        if self.telemetry_enabled
            && !self.telemetry_connected
            && eligible(self.last_connect_attempt_ms, RECONNECT_INTERVAL_MS, now_ms)
        {
            self.last_connect_attempt_ms = Some(now_ms);
            actions.push(SchedulerAction::ConnectTelemetry);
        }

        let exchange_due = eligible(self.last_exchange_ms, EXCHANGE_INTERVAL_MS, now_ms);
        if exchange_due {
            self.last_exchange_ms = Some(now_ms);
            actions.push(SchedulerAction::BusExchange);
        }

        if !exchange_due && self.indicator_on && now_ms >= self.indicator_off_ms {
            self.indicator_on = false;
            actions.push(SchedulerAction::IndicatorOff);
        }

        if self.link_mode == LinkMode::Local {
            if let Some(since_ms) = self.local_mode_since_ms {
                if now_ms.saturating_sub(since_ms) > LOCAL_MODE_WINDOW_MS {
                    actions.push(SchedulerAction::Restart);
                }
            }
        }

        actions
    }

    /// Ingests the response of a completed bus exchange. Updates the
    /// transaction counter and classification, arms the indicator when the
    /// exchange produced data, and emits a telemetry publish when the broker
    /// link is up. The sending role always classifies as a success.
    pub fn record_exchange(&mut self, response: &[u8], now_ms: u64) -> Vec<SchedulerAction> {
        self.exchange_count = self.exchange_count.saturating_add(1);
        let mut actions = Vec::new();

        let produced_data = match self.role {
            NodeRole::Tx => {
                self.bus_status = BusStatus::Ok;
                true
            }
            NodeRole::Rx => match frame::classify(response) {
                Some(length) => {
                    self.bus_status = BusStatus::Data;
                    self.rx_payload = response[..length].to_vec();
                    self.rx_hex = frame::render_hex(&self.rx_payload);
                    self.rx_ascii = frame::render_ascii(&self.rx_payload);
                    true
                }
                None => {
                    self.bus_status = BusStatus::Empty;
                    self.rx_payload.clear();
                    self.rx_hex.clear();
                    self.rx_ascii.clear();
                    false
                }
            },
        };

        if produced_data {
            self.arm_indicator(now_ms);
            actions.push(SchedulerAction::IndicatorOn);

            if self.telemetry_connected {
                if let Some(payload) = self.telemetry_payload() {
                    actions.push(SchedulerAction::Publish(payload));
                }
            }
        }

        actions
    }

    /// Ingests a driver-level bus fault (the exchange could not be clocked
    /// at all). The transaction still counts; nothing is published and the
    /// indicator stays untouched.
    pub fn record_exchange_fault(&mut self) {
        self.exchange_count = self.exchange_count.saturating_add(1);
        self.bus_status = BusStatus::Fail;
    }

    /// Re-arming while already on simply overwrites the off deadline.
    fn arm_indicator(&mut self, now_ms: u64) {
        self.indicator_on = true;
        self.indicator_off_ms = now_ms + self.role.indicator_pulse_ms();
    }

    fn telemetry_payload(&self) -> Option<String> {
        let serialized = match self.role {
            NodeRole::Tx => serde_json::to_string(&TxTelemetry {
                tx: self.exchange_count,
                msg: "HELLO",
            }),
            NodeRole::Rx => serde_json::to_string(&RxTelemetry {
                rx: self.exchange_count,
                hex: self.rx_hex.clone(),
                ascii: self.rx_ascii.clone(),
            }),
        };
        serialized.ok()
    }

    pub fn status_tx(&self, rssi: i32, uptime: u64, heap: u32) -> TxStatusPayload {
        TxStatusPayload {
            tx: self.exchange_count,
            spi: self.bus_status.as_str(),
            rssi,
            mqtt: self.telemetry_connected,
            uptime,
            heap,
        }
    }

    pub fn status_rx(&self, rssi: i32, uptime: u64, heap: u32) -> RxStatusPayload {
        RxStatusPayload {
            rx: self.exchange_count,
            spi: self.bus_status.as_str(),
            hex: self.rx_hex.clone(),
            ascii: self.rx_ascii.clone(),
            rssi,
            mqtt: self.telemetry_connected,
            uptime,
            heap,
        }
    }
}

fn eligible(last_ms: Option<u64>, interval_ms: u64, now_ms: u64) -> bool {
    last_ms
        .map(|last| now_ms.saturating_sub(last) >= interval_ms)
        .unwrap_or(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    Pending,
    TimedOut,
}

/// Bounded wait for the initial managed-link attempt, expressed as an
/// explicit poll so the "blocks only once, at startup, for at most 15 s"
/// contract is visible and testable. The driving loop sleeps
/// [`MANAGED_CONNECT_POLL_MS`] between polls.
#[derive(Debug, Clone, Copy)]
pub struct ConnectPoller {
    started_ms: u64,
    timeout_ms: u64,
}

impl ConnectPoller {
    pub fn new(now_ms: u64, timeout_ms: u64) -> Self {
        Self {
            started_ms: now_ms,
            timeout_ms,
        }
    }

    pub fn poll(&self, now_ms: u64, connected: bool) -> ConnectProgress {
        if connected {
            ConnectProgress::Connected
        } else if now_ms.saturating_sub(self.started_ms) >= self.timeout_ms {
            ConnectProgress::TimedOut
        } else {
            ConnectProgress::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn connected_scheduler(role: NodeRole) -> LinkScheduler {
        let mut scheduler = LinkScheduler::new(role);
        scheduler.set_link_mode(LinkMode::Managed, 0);
        scheduler.set_telemetry_enabled(true);
        scheduler.set_telemetry_connected(true);
        scheduler
    }

    #[test]
    fn idle_tick_emits_nothing() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);

        // First tick fires the exchange; immediately after, nothing is due.
        let _ = scheduler.tick(0);
        assert_eq!(scheduler.tick(1), Vec::new());
        assert_eq!(scheduler.tick(1_999), Vec::new());
    }

    #[test]
    fn exchange_fires_every_two_seconds() {
        let mut scheduler = connected_scheduler(NodeRole::Tx);

        assert!(scheduler.tick(0).contains(&SchedulerAction::BusExchange));
        assert!(!scheduler.tick(1_999).contains(&SchedulerAction::BusExchange));
        assert!(scheduler.tick(2_000).contains(&SchedulerAction::BusExchange));
        assert!(scheduler.tick(4_000).contains(&SchedulerAction::BusExchange));
    }

    #[test]
    fn reconnect_attempts_are_rate_limited() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);
        scheduler.set_telemetry_enabled(true);

        assert!(scheduler
            .tick(100)
            .contains(&SchedulerAction::ConnectTelemetry));
        // Second invocation inside the 5 s window is a no-op for telemetry.
        assert!(!scheduler
            .tick(101)
            .contains(&SchedulerAction::ConnectTelemetry));
        assert!(!scheduler
            .tick(5_099)
            .contains(&SchedulerAction::ConnectTelemetry));
        assert!(scheduler
            .tick(5_100)
            .contains(&SchedulerAction::ConnectTelemetry));
    }

    #[test]
    fn no_reconnect_once_connected_or_unconfigured() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);
        assert!(!scheduler
            .tick(100)
            .contains(&SchedulerAction::ConnectTelemetry));

        scheduler.set_telemetry_enabled(true);
        scheduler.set_telemetry_connected(true);
        assert!(!scheduler
            .tick(10_000)
            .contains(&SchedulerAction::ConnectTelemetry));
    }

    #[test]
    fn tx_exchange_arms_indicator_and_publishes() {
        let mut scheduler = connected_scheduler(NodeRole::Tx);
        let _ = scheduler.tick(2_000);

        let actions = scheduler.record_exchange(&[0_u8; 5], 2_001);

        assert_eq!(scheduler.exchange_count(), 1);
        assert_eq!(scheduler.bus_status(), BusStatus::Ok);
        assert_eq!(actions[0], SchedulerAction::IndicatorOn);
        assert_eq!(
            actions[1],
            SchedulerAction::Publish("{\"tx\":1,\"msg\":\"HELLO\"}".to_string())
        );
    }

    #[test]
    fn rx_exchange_with_data_publishes_hex_and_ascii() {
        let mut scheduler = connected_scheduler(NodeRole::Rx);
        let mut response = [0xFF_u8; 32];
        response[..5].copy_from_slice(b"HELLO");

        let actions = scheduler.record_exchange(&response, 10);

        assert_eq!(scheduler.bus_status(), BusStatus::Data);
        assert_eq!(actions[0], SchedulerAction::IndicatorOn);
        assert_eq!(
            actions[1],
            SchedulerAction::Publish(
                "{\"rx\":1,\"hex\":\"48 45 4C 4C 4F\",\"ascii\":\"HELLO\"}".to_string()
            )
        );
    }

    #[test]
    fn rx_empty_exchange_neither_flashes_nor_publishes() {
        let mut scheduler = connected_scheduler(NodeRole::Rx);

        let actions = scheduler.record_exchange(&[0x00_u8; 32], 10);

        assert_eq!(actions, Vec::new());
        assert_eq!(scheduler.bus_status(), BusStatus::Empty);
        assert!(!scheduler.indicator_is_on());
        assert_eq!(scheduler.status_rx(0, 0, 0).hex, "");
        assert_eq!(scheduler.status_rx(0, 0, 0).ascii, "");
    }

    #[test]
    fn publish_is_skipped_while_disconnected() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);
        scheduler.set_telemetry_enabled(true);

        let actions = scheduler.record_exchange(&[], 0);

        assert_eq!(actions, vec![SchedulerAction::IndicatorOn]);
    }

    #[test]
    fn indicator_goes_off_after_its_pulse() {
        let mut scheduler = connected_scheduler(NodeRole::Tx);
        let _ = scheduler.tick(2_000);
        let _ = scheduler.record_exchange(&[], 2_000);
        assert!(scheduler.indicator_is_on());

        assert!(!scheduler.tick(2_049).contains(&SchedulerAction::IndicatorOff));
        let actions = scheduler.tick(2_050);
        assert!(actions.contains(&SchedulerAction::IndicatorOff));
        assert!(!scheduler.indicator_is_on());
    }

    #[test]
    fn rx_pulse_is_eighty_milliseconds() {
        let mut scheduler = connected_scheduler(NodeRole::Rx);
        let mut response = [0_u8; 32];
        response[0] = 0x41;
        let _ = scheduler.record_exchange(&response, 1_000);

        assert!(!scheduler.tick(1_079).contains(&SchedulerAction::IndicatorOff));
        assert!(scheduler.tick(1_080).contains(&SchedulerAction::IndicatorOff));
    }

    #[test]
    fn rearm_overwrites_off_deadline() {
        let mut scheduler = connected_scheduler(NodeRole::Tx);
        let _ = scheduler.record_exchange(&[], 0);
        let _ = scheduler.record_exchange(&[], 40);

        // The first deadline (50) has passed, but re-arming moved it to 90.
        assert!(!scheduler.tick(60).contains(&SchedulerAction::IndicatorOff));
        assert!(scheduler.tick(90).contains(&SchedulerAction::IndicatorOff));
    }

    #[test]
    fn local_mode_restarts_after_safety_window() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);
        scheduler.set_link_mode(LinkMode::Local, 1_000);

        assert!(!scheduler.tick(301_000).contains(&SchedulerAction::Restart));
        assert!(scheduler.tick(301_001).contains(&SchedulerAction::Restart));
    }

    #[test]
    fn managed_mode_never_hits_the_safety_window() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);
        scheduler.set_link_mode(LinkMode::Managed, 0);

        assert!(!scheduler.tick(1_000_000).contains(&SchedulerAction::Restart));
    }

    #[test]
    fn actions_keep_their_fixed_order() {
        let mut scheduler = LinkScheduler::new(NodeRole::Tx);
        scheduler.set_link_mode(LinkMode::Local, 0);
        scheduler.set_telemetry_enabled(true);

        let actions = scheduler.tick(400_000);

        assert_eq!(
            actions,
            vec![
                SchedulerAction::ConnectTelemetry,
                SchedulerAction::BusExchange,
                SchedulerAction::Restart,
            ]
        );
    }

    #[test]
    fn stale_off_deadline_yields_to_a_due_exchange() {
        let mut scheduler = connected_scheduler(NodeRole::Tx);
        let _ = scheduler.tick(0);
        let _ = scheduler.record_exchange(&[], 0);
        assert!(scheduler.indicator_is_on());

        // A stalled loop wakes up with the off deadline (50) long past and
        // the next exchange due. The off is withheld so the pulse the
        // upcoming exchange arms survives the invocation.
        assert_eq!(scheduler.tick(2_000), vec![SchedulerAction::BusExchange]);
        let actions = scheduler.record_exchange(&[], 2_000);
        assert_eq!(actions[0], SchedulerAction::IndicatorOn);
        assert!(scheduler.indicator_is_on());

        // The fresh pulse then expires on its own deadline.
        assert!(!scheduler.tick(2_049).contains(&SchedulerAction::IndicatorOff));
        assert!(scheduler.tick(2_050).contains(&SchedulerAction::IndicatorOff));
    }

    #[test]
    fn withheld_off_fires_next_tick_when_the_exchange_stays_dark() {
        let mut scheduler = connected_scheduler(NodeRole::Rx);
        let mut response = [0_u8; 32];
        response[0] = 0x41;
        let _ = scheduler.tick(0);
        let _ = scheduler.record_exchange(&response, 0);

        // The coinciding exchange faults, so nothing re-arms; the pulse is
        // cleared on the following pass instead.
        assert_eq!(scheduler.tick(2_000), vec![SchedulerAction::BusExchange]);
        scheduler.record_exchange_fault();
        assert!(scheduler.tick(2_010).contains(&SchedulerAction::IndicatorOff));
    }

    #[test]
    fn bus_fault_counts_without_flashing() {
        let mut scheduler = connected_scheduler(NodeRole::Rx);
        scheduler.record_exchange_fault();

        assert_eq!(scheduler.exchange_count(), 1);
        assert_eq!(scheduler.bus_status(), BusStatus::Fail);
        assert!(!scheduler.indicator_is_on());
    }

    #[test]
    fn counters_survive_mode_changes() {
        let mut scheduler = connected_scheduler(NodeRole::Rx);
        let _ = scheduler.record_exchange(&[0x41], 0);
        let _ = scheduler.record_exchange(&[0x00], 10);
        scheduler.set_link_mode(LinkMode::Local, 20);

        assert_eq!(scheduler.exchange_count(), 2);
    }

    #[test]
    fn connect_poller_bounds_the_startup_wait() {
        let poller = ConnectPoller::new(1_000, MANAGED_CONNECT_TIMEOUT_MS);

        assert_eq!(poller.poll(1_250, false), ConnectProgress::Pending);
        assert_eq!(poller.poll(15_999, false), ConnectProgress::Pending);
        assert_eq!(poller.poll(9_000, true), ConnectProgress::Connected);
        assert_eq!(poller.poll(16_000, false), ConnectProgress::TimedOut);
    }
}
