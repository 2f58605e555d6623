pub const TOPIC_TX_DEFAULT: &str = "spilink/tx";
pub const TOPIC_RX_DEFAULT: &str = "spilink/rx";
