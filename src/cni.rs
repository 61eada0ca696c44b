//! One-shot CNI configuration patching.
//!
//! The CNI plugin on each node needs the node's pod subnet in its IPAM
//! section.  This is a single edit at startup, not a reconciled resource.

use std::io::Write;
use std::path::Path;

use ipnetwork::Ipv4Network;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::membership::{local_subnet, MembershipSource};

#[derive(Debug, Serialize, Deserialize)]
struct IpamConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subnet: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PluginConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipam: Option<IpamConf>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PluginConfList {
    plugins: Vec<PluginConf>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

fn invalid(path: &Path, reason: impl Into<String>) -> Error {
    Error::CniConfig {
        path: path.display().to_string(),
        reason: reason.into(),
    }
}

/// Write `subnet` into the IPAM section of the CNI config at `path`.
///
/// `.conflist` files get it in the first plugin that has an `ipam` object;
/// any other file is treated as a single plugin config.  Unknown keys are
/// kept.
pub fn insert_subnet(path: &Path, subnet: Ipv4Network) -> Result<()> {
    let raw = std::fs::read(path)?;
    let cidr = subnet.to_string();

    let updated = if path.extension().and_then(|e| e.to_str()) == Some("conflist") {
        let mut list: PluginConfList = serde_json::from_slice(&raw)
            .map_err(|e| invalid(path, format!("parse: {}", e)))?;
        let ipam = list
            .plugins
            .iter_mut()
            .find_map(|p| p.ipam.as_mut())
            .ok_or_else(|| invalid(path, "no plugin has an ipam section"))?;
        ipam.subnet = Some(cidr);
        serde_json::to_vec_pretty(&list)?
    } else {
        let mut plugin: PluginConf = serde_json::from_slice(&raw)
            .map_err(|e| invalid(path, format!("parse: {}", e)))?;
        let ipam = plugin
            .ipam
            .as_mut()
            .ok_or_else(|| invalid(path, "missing ipam section"))?;
        ipam.subnet = Some(cidr);
        serde_json::to_vec_pretty(&plugin)?
    };

    replace_file(path, &updated)?;
    Ok(())
}

/// Write `contents` to a temporary file next to `path` and rename it into
/// place, so readers only ever see the old or the new config.  The original
/// file's permissions are kept.
fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let permissions = std::fs::metadata(path)?.permissions();

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().set_permissions(permissions)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Look up the local node's subnet and write it into the CNI config.
pub async fn patch_cni_config(
    membership: &dyn MembershipSource,
    node_name: &str,
    path: &Path,
) -> Result<()> {
    let subnet = local_subnet(membership, node_name).await?;
    insert_subnet(path, subnet)?;
    info!("Wrote subnet {} into {}", subnet, path.display());
    Ok(())
}
