//! Configuration for the datagram reliability scenario.

use serde::{Deserialize, Serialize};

use super::capacity::CapacityProbe;
use super::retry::RetryPolicy;

/// Operating system family the scenario runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPlatform {
    /// Linux.
    Linux,
    /// macOS; IPv6 multicast needs an explicit interface.
    MacOs,
    /// Windows.
    Windows,
    /// Android; multicast and bidirectional sections are skipped.
    Android,
    /// Anything else.
    Other,
}

impl HostPlatform {
    /// Platform of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Other
        }
    }
}

/// What an unreachable multicast group turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MulticastSeverity {
    /// Report and continue; multicast often depends on firewall policy.
    #[default]
    Warn,
    /// Fail the scenario.
    Fail,
}

/// Scenario parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Protocol used in every endpoint string (`udp`, or `test-udp` to go
    /// through the fault decorator).
    pub protocol: String,
    /// Unicast host of the test server and reply adapter.
    pub host: String,
    /// Test server port.
    pub server_port: u16,
    /// Reply adapter port.
    pub reply_port: u16,
    /// Multicast group port.
    pub multicast_port: u16,
    /// IPv4 multicast group.
    pub ipv4_multicast_group: String,
    /// IPv6 multicast group.
    pub ipv6_multicast_group: String,
    /// Interface bound for IPv6 multicast on macOS.
    pub ipv6_multicast_interface: String,
    /// Use the IPv6 multicast group.
    pub ipv6: bool,
    /// Compression is on; sizes on the wire are not fixed, so the capacity
    /// probe is skipped.
    pub compress: bool,
    /// Host platform.
    pub platform: HostPlatform,
    /// Retry budget shared by every quorum round.
    pub retry: RetryPolicy,
    /// Replies expected from the unicast and bidirectional rounds.
    pub unicast_quorum: usize,
    /// Receivers expected to answer a multicast ping.
    pub multicast_quorum: usize,
    /// Outcome of a multicast quorum miss.
    pub multicast_severity: MulticastSeverity,
    /// Capacity probe settings.
    pub capacity: CapacityProbe,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            protocol: "udp".to_string(),
            host: "127.0.0.1".to_string(),
            server_port: 12010,
            reply_port: 12030,
            multicast_port: 12020,
            ipv4_multicast_group: "239.255.1.1".to_string(),
            ipv6_multicast_group: "ff15::1:1".to_string(),
            ipv6_multicast_interface: "::1".to_string(),
            ipv6: false,
            compress: false,
            platform: HostPlatform::current(),
            retry: RetryPolicy::default(),
            unicast_quorum: 3,
            multicast_quorum: 5,
            multicast_severity: MulticastSeverity::Warn,
            capacity: CapacityProbe::default(),
        }
    }
}

impl HarnessConfig {
    /// Default configuration routed through the fault decorator.
    pub fn decorated() -> Self {
        Self {
            protocol: format!("{}udp", crate::transport::PROTOCOL_PREFIX),
            ..Self::default()
        }
    }

    /// Endpoint string of the unicast test server.
    pub fn server_endpoint(&self) -> String {
        format!("{} -h {} -p {}", self.protocol, self.host, self.server_port)
    }

    /// Endpoint string of the reply adapter.
    pub fn reply_endpoint(&self) -> String {
        format!("{} -h {} -p {}", self.protocol, self.host, self.reply_port)
    }

    /// Endpoint string of the multicast group for this IP version and platform.
    pub fn multicast_endpoint(&self) -> String {
        if !self.ipv6 {
            return format!(
                "{} -h {} -p {}",
                self.protocol, self.ipv4_multicast_group, self.multicast_port
            );
        }
        if self.platform == HostPlatform::MacOs {
            format!(
                "{} -h \"{}\" -p {} --interface \"{}\"",
                self.protocol,
                self.ipv6_multicast_group,
                self.multicast_port,
                self.ipv6_multicast_interface
            )
        } else {
            format!(
                "{} -h \"{}\" -p {}",
                self.protocol, self.ipv6_multicast_group, self.multicast_port
            )
        }
    }
}
