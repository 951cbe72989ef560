//! Congestion controller selection

use std::fmt;
use std::sync::Arc;

use quinn::congestion::{BbrConfig, ControllerFactory, CubicConfig, NewRenoConfig};
use quinn::TransportConfig;
use serde::{Deserialize, Serialize};

/// Initial QUIC packet size assumed when sizing congestion windows.
pub const INITIAL_PACKET_SIZE: u64 = 1200;

/// Initial window of the quiche-style BBR sender, in packets.
const BBR_QUICHE_INITIAL_WINDOW_PACKETS: u64 = 32;

/// Congestion control policy attached to a connection when it is created.
///
/// Unknown and empty names resolve to [`CongestionControl::Bbr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CongestionControl {
    Cubic,
    NewReno,
    #[default]
    Bbr,
    Bbr2,
    Bbr2Aggressive,
    BbrQuiche,
}

impl CongestionControl {
    /// Resolves a configured policy name. Names are case-sensitive.
    pub fn from_name(name: &str) -> Self {
        match name {
            "cubic" => Self::Cubic,
            "new_reno" => Self::NewReno,
            "bbr2" => Self::Bbr2,
            "bbr2_aggressive" => Self::Bbr2Aggressive,
            "bbr_quiche" => Self::BbrQuiche,
            _ => Self::Bbr,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cubic => "cubic",
            Self::NewReno => "new_reno",
            Self::Bbr => "bbr",
            Self::Bbr2 => "bbr2",
            Self::Bbr2Aggressive => "bbr2_aggressive",
            Self::BbrQuiche => "bbr_quiche",
        }
    }

    /// Policy used for every accepted server connection.
    ///
    /// The configured value is accepted but not honored, servers always run BBR.
    pub fn for_server(_configured: Self) -> Self {
        Self::Bbr
    }

    /// Builds the quinn controller factory for this policy.
    pub fn controller_factory(&self) -> Arc<dyn ControllerFactory + Send + Sync + 'static> {
        match self {
            Self::Cubic => Arc::new(CubicConfig::default()),
            Self::NewReno => Arc::new(NewRenoConfig::default()),
            Self::Bbr | Self::Bbr2 => Arc::new(BbrConfig::default()),
            Self::BbrQuiche => {
                let mut config = BbrConfig::default();
                config.initial_window(BBR_QUICHE_INITIAL_WINDOW_PACKETS * INITIAL_PACKET_SIZE);
                Arc::new(config)
            }
            Self::Bbr2Aggressive => {
                let mut config = BbrConfig::default();
                config.initial_window(32 * INITIAL_PACKET_SIZE);
                Arc::new(config)
            }
        }
    }

    /// Installs the policy into a transport configuration that has not been used yet.
    pub fn apply(&self, transport: &mut TransportConfig) {
        transport.congestion_controller_factory(self.controller_factory());
    }
}

impl From<String> for CongestionControl {
    fn from(name: String) -> Self {
        Self::from_name(&name)
    }
}

impl From<CongestionControl> for String {
    fn from(cc: CongestionControl) -> Self {
        cc.as_str().to_string()
    }
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
