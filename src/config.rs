use clap::Parser;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::mesh::tailscale::DEFAULT_SOCKET;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Name of the node this daemon runs on.
    pub node_name: String,
    pub mesh_interface: String,
    pub bridge_interface: String,
    pub mesh_sync_secs: u64,
    pub route_sync_secs: u64,
    pub firewall_sync_secs: u64,
    pub health_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub tailscaled_socket: PathBuf,
    pub cni_conf_path: PathBuf,
    pub patch_cni: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            mesh_interface: "tailscale0".into(),
            bridge_interface: "kube-bridge".into(),
            mesh_sync_secs: 300,
            route_sync_secs: 300,
            firewall_sync_secs: 300,
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tailscaled_socket: DEFAULT_SOCKET.into(),
            cni_conf_path: "/etc/cni/net.d/10-tailscale.conflist".into(),
            patch_cni: true,
        }
    }
}

/// Command-line overrides.  Anything left unset falls through to the
/// config files and `MESHSYNC_*` environment variables.
#[derive(Debug, Clone, Default, Parser, Serialize)]
#[command(name = "meshsync")]
#[command(about = "Keeps node routes, firewall rules and mesh preferences in sync with cluster membership")]
#[command(version)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "meshsync.toml")]
    #[serde(skip)]
    pub config: PathBuf,

    /// Name of the local node
    #[arg(long, env = "NODE_NAME")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Seconds between mesh preference syncs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mesh_sync_secs: Option<u64>,

    /// Seconds between route table syncs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_sync_secs: Option<u64>,

    /// Seconds between firewall syncs
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall_sync_secs: Option<u64>,

    /// Address the health endpoints bind to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_addr: Option<SocketAddr>,

    /// Address the metrics endpoint binds to
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    /// Defaults, then the TOML and JSON files, then `MESHSYNC_*` variables,
    /// then the command line.
    pub fn figment(cli: &Cli) -> Figment {
        let json = cli.config.with_extension("json");
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(&cli.config))
            .merge(Json::file(json))
            .merge(Env::prefixed("MESHSYNC_"))
            .merge(Serialized::defaults(cli))
    }

    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let config: Config = Self::figment(cli)
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_name.trim().is_empty() {
            anyhow::bail!("node name is not set (use --node-name or NODE_NAME)");
        }
        for (name, secs) in [
            ("mesh_sync_secs", self.mesh_sync_secs),
            ("route_sync_secs", self.route_sync_secs),
            ("firewall_sync_secs", self.firewall_sync_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        Ok(())
    }

    pub fn mesh_sync_interval(&self) -> Duration {
        Duration::from_secs(self.mesh_sync_secs)
    }

    pub fn route_sync_interval(&self) -> Duration {
        Duration::from_secs(self.route_sync_secs)
    }

    pub fn firewall_sync_interval(&self) -> Duration {
        Duration::from_secs(self.firewall_sync_secs)
    }

    #[cfg(test)]
    pub fn for_node(name: &str) -> Self {
        Self {
            node_name: name.to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn cli() -> Cli {
        Cli {
            config: "meshsync.toml".into(),
            ..Cli::default()
        }
    }

    #[test]
    fn defaults_match_daemon_expectations() {
        let cfg = Config::default();
        assert_eq!(cfg.mesh_interface, "tailscale0");
        assert_eq!(cfg.bridge_interface, "kube-bridge");
        assert_eq!(cfg.route_sync_interval(), Duration::from_secs(300));
        assert_eq!(cfg.health_addr.port(), 8081);
        assert_eq!(cfg.metrics_addr.port(), 8080);
    }

    #[test]
    fn layers_file_env_and_cli() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "meshsync.toml",
                r#"
                    node_name = "from-file"
                    mesh_sync_secs = 60
                    route_sync_secs = 60
                "#,
            )?;
            jail.set_env("MESHSYNC_ROUTE_SYNC_SECS", "30");
            jail.set_env("MESHSYNC_BRIDGE_INTERFACE", "cni0");

            let mut cli = cli();
            cli.node_name = Some("node-a".into());

            let cfg: Config = Config::figment(&cli).extract()?;
            assert_eq!(cfg.node_name, "node-a");
            assert_eq!(cfg.mesh_sync_secs, 60);
            assert_eq!(cfg.route_sync_secs, 30);
            assert_eq!(cfg.firewall_sync_secs, 300);
            assert_eq!(cfg.bridge_interface, "cni0");
            Ok(())
        });
    }

    #[test]
    fn json_file_sits_next_to_toml() {
        Jail::expect_with(|jail| {
            jail.create_file("meshsync.json", r#"{"node_name": "json-node", "patch_cni": false}"#)?;
            let cfg: Config = Config::figment(&cli()).extract()?;
            assert_eq!(cfg.node_name, "json-node");
            assert!(!cfg.patch_cni);
            Ok(())
        });
    }

    #[test]
    fn load_rejects_missing_node_name() {
        Jail::expect_with(|_| {
            let err = Config::load(&cli()).unwrap_err();
            assert!(err.to_string().contains("node name"));
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut cfg = Config::for_node("a");
        cfg.firewall_sync_secs = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("firewall_sync_secs"));
    }
}
