//! BLE transport configuration

use std::time::Duration;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Configuration for the BLE transport
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BleTransportConfig {
    /// Serial baud rate of the dongle
    pub baud_rate: u32,
    /// Use RTS/CTS flow control on the serial link
    pub hardware_flow_control: bool,
    /// Maximum time to wait for the dongle to answer a command
    pub command_timeout: Duration,
    /// Maximum time to wait for a link to come up
    pub connect_timeout: Duration,
    /// Maximum time to wait for an RPC response
    pub rpc_timeout: Duration,
    /// Maximum time to wait for one GATT procedure during probing
    pub probe_timeout: Duration,
    /// Maximum time to wait for a connection status report
    pub status_timeout: Duration,
    /// How long a scan listens for advertisements
    pub scan_duration: Duration,
    /// Scan interval in units of 625us
    pub scan_interval: u16,
    /// Scan window in units of 625us
    pub scan_window: u16,
    /// Connection interval bounds in units of 1.25ms
    pub conn_interval_min: u16,
    pub conn_interval_max: u16,
    /// Supervision timeout in units of 10ms
    pub supervision_timeout: u16,
    /// Peripheral latency in connection events
    pub latency: u16,
    /// Address type used for connect_direct (0 public, 1 random)
    pub address_type: u8,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            hardware_flow_control: true,
            command_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(6),
            rpc_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            status_timeout: Duration::from_millis(500),
            scan_duration: Duration::from_secs(1),
            scan_interval: 2100,
            scan_window: 2100,
            conn_interval_min: 6,
            conn_interval_max: 100,
            supervision_timeout: 100,
            latency: 0,
            address_type: 1,
        }
    }
}

impl BleTransportConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set dongle command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set RPC response timeout
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set GATT probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set liveness status timeout
    pub fn with_status_timeout(mut self, timeout: Duration) -> Self {
        self.status_timeout = timeout;
        self
    }

    /// Set scan duration
    pub fn with_scan_duration(mut self, duration: Duration) -> Self {
        self.scan_duration = duration;
        self
    }

    /// Set serial baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Enable or disable RTS/CTS flow control
    pub fn with_hardware_flow_control(mut self, enabled: bool) -> Self {
        self.hardware_flow_control = enabled;
        self
    }

    /// Set the address type used when connecting
    pub fn with_address_type(mut self, address_type: u8) -> Self {
        self.address_type = address_type;
        self
    }
}
