//! Configuration surface of PAMR agents and routers.
//!
//! All structs deserialize from TOML with `#[serde(default)]`, so a config
//! file only needs to name the settings it changes.

use crate::error::{PamrError, PamrResult};
use crate::id::{AgentId, MagicCookie};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port of the router.
pub const DEFAULT_ROUTER_PORT: u16 = 33647;

/// Convert a millisecond setting where `0` means "no limit".
fn optional_ms(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Root configuration file (`~/.pamr/config.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PamrConfig {
    /// Default log filter when `RUST_LOG` is not set.
    pub log_level: String,
    /// Router daemon settings.
    pub router: RouterConfig,
    /// Settings used by agents started from this configuration.
    pub agent: AgentConfig,
}

impl Default for PamrConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            router: RouterConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

/// Which transport an agent uses to reach the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketFactoryKind {
    /// Direct TCP connection.
    #[default]
    Plain,
    /// TCP connection relayed by an HTTP CONNECT gateway.
    Tunnel,
}

/// Settings of the tunneled transport.
///
/// The tunnel is a plaintext HTTP CONNECT relay. It offers reachability
/// only, with no confidentiality or authentication of the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// `host:port` of the CONNECT gateway.
    pub gateway: Option<String>,
    /// File listing the gateways this agent is allowed to use, one per line.
    pub known_hosts: Option<PathBuf>,
    /// Interval between idle-connection sweeps. 0 disables the sweeper.
    pub gc_period_ms: u64,
    /// Connections idle for longer than this are closed by the sweeper.
    pub gc_idle_time_ms: u64,
    /// Timeout for reaching the gateway and completing the CONNECT exchange.
    pub connect_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            gateway: None,
            known_hosts: None,
            gc_period_ms: 10_000,
            gc_idle_time_ms: 60_000,
            connect_timeout_ms: 60_000,
        }
    }
}

impl TunnelConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        optional_ms(self.connect_timeout_ms)
    }

    /// Sweep period and idle threshold, or `None` when GC is disabled.
    pub fn gc_policy(&self) -> Option<(Duration, Duration)> {
        match (optional_ms(self.gc_period_ms), optional_ms(self.gc_idle_time_ms)) {
            (Some(period), Some(idle)) => Some((period, idle)),
            _ => None,
        }
    }
}

/// Settings of one agent (tunnel endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Host name or IP of the router.
    pub router_address: String,
    /// TCP port of the router.
    pub router_port: u16,
    /// Timeout for establishing the tunnel. 0 blocks indefinitely.
    pub connect_timeout_ms: u64,
    /// Reserved agent id to request (0..4096).
    pub agent_id: Option<u64>,
    /// Cookie proving ownership of the reserved id.
    pub magic_cookie: Option<MagicCookie>,
    /// Transport used to reach the router.
    pub socket_factory: SocketFactoryKind,
    /// Settings of the tunneled transport.
    pub tunnel: TunnelConfig,
    /// How long a blocking call waits for its reply. 0 waits forever.
    pub response_timeout_ms: u64,
    /// Reconnection attempts after a tunnel failure before the agent gives
    /// up. 0 retries forever.
    pub max_reconnect_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            router_address: "localhost".to_string(),
            router_port: DEFAULT_ROUTER_PORT,
            connect_timeout_ms: 3_000,
            agent_id: None,
            magic_cookie: None,
            socket_factory: SocketFactoryKind::Plain,
            tunnel: TunnelConfig::default(),
            response_timeout_ms: 300_000,
            max_reconnect_attempts: 20,
        }
    }
}

impl AgentConfig {
    /// Configuration pointing at a router on `address:port`.
    pub fn for_router(address: impl Into<String>, port: u16) -> Self {
        Self {
            router_address: address.into(),
            router_port: port,
            ..Self::default()
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        optional_ms(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        optional_ms(self.response_timeout_ms)
    }

    /// The reserved id this agent asks for, if any.
    pub fn reserved_agent_id(&self) -> Option<AgentId> {
        self.agent_id.map(AgentId)
    }

    /// Check the settings that cannot be fixed up with defaults.
    pub fn validate(&self) -> PamrResult<()> {
        if self.router_address.trim().is_empty() {
            return Err(PamrError::Config("router_address must be set".into()));
        }
        if self.router_port == 0 {
            return Err(PamrError::Config("router_port must not be 0".into()));
        }
        if let Some(id) = self.agent_id {
            if id >= AgentId::MIN_DYNAMIC {
                return Err(PamrError::Config(format!(
                    "agent_id {id} is outside the reserved range 0..{}",
                    AgentId::MIN_DYNAMIC
                )));
            }
            if self.magic_cookie.is_none() {
                return Err(PamrError::Config(
                    "agent_id is set but magic_cookie is missing".into(),
                ));
            }
        }
        if self.socket_factory == SocketFactoryKind::Tunnel && self.tunnel.gateway.is_none() {
            return Err(PamrError::Config(
                "socket_factory = \"tunnel\" requires tunnel.gateway".into(),
            ));
        }
        Ok(())
    }
}

/// Settings of the router daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Address to bind the listener on.
    pub bind_address: String,
    /// TCP port to listen on. 0 picks a free port.
    pub port: u16,
    /// Clients silent for longer than this are disconnected. Heartbeats are
    /// sent every third of it.
    pub heartbeat_timeout_ms: u64,
    /// Disconnected clients are forgotten after this long. `None` keeps them
    /// forever.
    pub client_eviction_timeout_ms: Option<u64>,
    /// TOML file with the reserved agent ids and the admin cookie.
    pub reserved_agents_file: Option<PathBuf>,
    /// Log agent connections and disconnections at debug level.
    pub admin_verbose: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_ROUTER_PORT,
            heartbeat_timeout_ms: 30_000,
            client_eviction_timeout_ms: None,
            reserved_agents_file: None,
            admin_verbose: false,
        }
    }
}

impl RouterConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms.max(3))
    }

    pub fn eviction_timeout(&self) -> Option<Duration> {
        self.client_eviction_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn validate(&self) -> PamrResult<()> {
        if self.heartbeat_timeout_ms == 0 {
            return Err(PamrError::Config(
                "heartbeat_timeout_ms must be positive".into(),
            ));
        }
        if self.heartbeat_timeout_ms > u64::from(u32::MAX) {
            return Err(PamrError::Config(
                "heartbeat_timeout_ms does not fit the registration reply".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.router_port, 33647);
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(3000)));
        assert_eq!(config.response_timeout(), Some(Duration::from_secs(300)));
        assert_eq!(config.socket_factory, SocketFactoryKind::Plain);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_means_unbounded() {
        let config = AgentConfig {
            connect_timeout_ms: 0,
            response_timeout_ms: 0,
            ..AgentConfig::default()
        };
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.response_timeout(), None);
    }

    #[test]
    fn test_reserved_id_requires_cookie() {
        let mut config = AgentConfig {
            agent_id: Some(12),
            ..AgentConfig::default()
        };
        assert!(matches!(config.validate(), Err(PamrError::Config(_))));

        config.magic_cookie = Some(MagicCookie::from_secret("twelve"));
        assert!(config.validate().is_ok());

        config.agent_id = Some(4096);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tunnel_requires_gateway() {
        let config = AgentConfig {
            socket_factory: SocketFactoryKind::Tunnel,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gc_disabled_by_zero() {
        let tunnel = TunnelConfig {
            gc_period_ms: 0,
            ..TunnelConfig::default()
        };
        assert!(tunnel.gc_policy().is_none());
        assert!(TunnelConfig::default().gc_policy().is_some());
    }

    #[test]
    fn test_parse_from_toml() {
        let text = r#"
            log_level = "debug"

            [router]
            port = 4000
            client_eviction_timeout_ms = 120000

            [agent]
            router_address = "relay.example.org"
            socket_factory = "tunnel"
            agent_id = 7
            magic_cookie = "seven"

            [agent.tunnel]
            gateway = "gw.example.org:8080"
            gc_period_ms = 0
        "#;
        let config: PamrConfig = toml::from_str(text).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.router.port, 4000);
        assert_eq!(
            config.router.eviction_timeout(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(config.router.heartbeat_timeout_ms, 30_000);
        assert_eq!(config.agent.router_port, 33647);
        assert_eq!(config.agent.socket_factory, SocketFactoryKind::Tunnel);
        assert_eq!(
            config.agent.magic_cookie,
            Some(MagicCookie::from_secret("seven"))
        );
        assert!(config.agent.tunnel.gc_policy().is_none());
        assert!(config.agent.validate().is_ok());
    }
}
