//! Cluster discovery.
//!
//! Builds a fresh [`ClusterSnapshot`] from a handful of local commands:
//! the hostname (cluster name and local lnn), the kernel version banner,
//! the hardware generation, the node listing and the set of up devices.
//! Nodes missing from the up set get a status probe to tell an unmounted
//! filesystem apart from an unreachable node.

use crate::config::ClusterConfig;
use crate::error::ClusterCheckError;
use crate::models::{ClusterSnapshot, Lnn, Node, NodeStatus};
use crate::shell::Shell;
use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Placeholder for the hardware line when the probe prints nothing.
const UNKNOWN_HARDWARE: &str = "unknown";

fn hostname_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.+)-([0-9]+)$").expect("valid hostname regex"))
}

fn health_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)Node\s+Health:\s*([A-Za-z-]*)").expect("valid health regex")
    })
}

/// Split `<cluster>-<lnn>` into the cluster name and the local lnn.
pub fn parse_hostname(output: &str) -> Result<(String, Lnn), ClusterCheckError> {
    let line = output.trim();
    let caps = hostname_regex().captures(line).ok_or_else(|| {
        ClusterCheckError::Discovery(format!("hostname '{}' is not <cluster>-<lnn>", line))
    })?;
    let lnn = caps[2]
        .parse::<Lnn>()
        .map_err(|e| ClusterCheckError::Discovery(format!("bad lnn in hostname '{}': {}", line, e)))?;
    Ok((caps[1].to_string(), lnn))
}

/// Software version and build id from a `uname -v` banner such as
/// `Isilon OneFS v8.2.2.0 B_8_2_2_001(RELEASE): 0x...`.
pub fn parse_uname(output: &str) -> (String, String) {
    let mut fields = output.trim().splitn(5, ' ').skip(2);
    let version = fields.next().unwrap_or("").to_string();
    let build = fields.next().unwrap_or("").replace(':', "");
    (version, build)
}

/// Parse the node listing, one `lnn id hostname ip` line per node.
///
/// Blank lines are skipped; short lines and duplicate lnns are discovery
/// errors because every later attribution depends on this table.
pub fn parse_node_listing(output: &str) -> Result<Vec<(Lnn, u32, String, String)>, ClusterCheckError> {
    let mut seen = BTreeSet::new();
    let mut nodes = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(ClusterCheckError::Discovery(format!(
                "node listing line has {} fields: '{}'",
                fields.len(),
                line
            )));
        }
        let lnn = fields[0]
            .parse::<Lnn>()
            .map_err(|_| ClusterCheckError::Discovery(format!("bad lnn in '{}'", line)))?;
        let id = fields[1]
            .parse::<u32>()
            .map_err(|_| ClusterCheckError::Discovery(format!("bad node id in '{}'", line)))?;
        if !seen.insert(lnn) {
            return Err(ClusterCheckError::Discovery(format!(
                "lnn {} listed more than once",
                lnn
            )));
        }
        nodes.push((lnn, id, fields[2].to_string(), fields[3].to_string()));
    }

    if nodes.is_empty() {
        return Err(ClusterCheckError::Discovery("node listing is empty".to_string()));
    }
    Ok(nodes)
}

/// Parse the up-device set, e.g. `{1-3,5}`. Unparseable members are
/// ignored with a warning, which leaves those nodes marked down.
pub fn parse_up_nodes(output: &str) -> BTreeSet<u32> {
    let cleaned: String = output
        .chars()
        .filter(|c| !matches!(c, '{' | '}') && !c.is_whitespace())
        .collect();

    let mut ids = BTreeSet::new();
    for part in cleaned.split(',').filter(|p| !p.is_empty()) {
        let parsed = match part.split_once('-') {
            Some((lo, hi)) => lo
                .parse::<u32>()
                .and_then(|lo| hi.parse::<u32>().map(|hi| (lo, hi)))
                .map(|(lo, hi)| ids.extend(lo..=hi)),
            None => part.parse::<u32>().map(|id| {
                ids.insert(id);
            }),
        };
        if parsed.is_err() {
            warn!("Ignoring unparseable up-node entry '{}'", part);
        }
    }
    ids
}

/// The `Node Health` value of a status probe, if present.
pub fn parse_node_health(output: &str) -> Option<String> {
    health_regex()
        .captures(output)
        .map(|caps| caps[1].to_string())
}

/// Discovers the cluster through a [`Shell`].
pub struct ClusterProbe {
    shell: Arc<dyn Shell>,
    config: ClusterConfig,
    single_node: bool,
}

impl ClusterProbe {
    pub fn new(shell: Arc<dyn Shell>, config: ClusterConfig, single_node: bool) -> Self {
        Self {
            shell,
            config,
            single_node,
        }
    }

    /// Run a discovery command, requiring success.
    async fn required(&self, command: &str) -> Result<String, ClusterCheckError> {
        let out = self
            .shell
            .run(command, self.config.timeout())
            .await
            .map_err(|e| ClusterCheckError::Discovery(format!("{}: {:#}", command, e)))?;
        if !out.success() {
            let reason = if out.timed_out {
                "timed out".to_string()
            } else {
                format!("exit {:?}: {}", out.exit_code, out.stderr.trim())
            };
            return Err(ClusterCheckError::Discovery(format!("{} ({})", command, reason)));
        }
        Ok(out.stdout)
    }

    /// Run a discovery command whose failure only degrades the snapshot.
    async fn optional(&self, command: &str) -> String {
        match self.shell.run(command, self.config.timeout()).await {
            Ok(out) if out.success() => out.stdout,
            Ok(out) => {
                debug!("{} failed with {:?}", command, out.exit_code);
                String::new()
            }
            Err(e) => {
                debug!("{} failed: {:#}", command, e);
                String::new()
            }
        }
    }

    /// Status of a node that is not in the up set.
    async fn probe_down_node(&self, lnn: Lnn) -> NodeStatus {
        let command = self.config.status_command.replace("{lnn}", &lnn.to_string());
        match self.shell.run(&command, self.config.timeout()).await {
            Ok(out) if out.success() => match parse_node_health(&out.stdout) {
                Some(health) if health.contains('D') => {
                    info!("Node {} reports health {}: filesystem unmounted", lnn, health);
                    NodeStatus::OfflineUnmounted
                }
                Some(_) => NodeStatus::OfflineUnreachable,
                None => {
                    warn!("Unable to parse Node Health for node {}", lnn);
                    NodeStatus::OfflineUnreachable
                }
            },
            _ => {
                debug!("Status probe for node {} failed", lnn);
                NodeStatus::OfflineUnreachable
            }
        }
    }

    /// Build a fresh snapshot of the cluster.
    pub async fn snapshot(&self) -> Result<ClusterSnapshot, ClusterCheckError> {
        let (name, local_lnn) = parse_hostname(&self.required(&self.config.hostname_command).await?)?;
        let (software_version, build) = parse_uname(&self.optional(&self.config.version_command).await);

        let hardware = self.optional(&self.config.hardware_command).await;
        let hardware = match hardware.trim() {
            "" => UNKNOWN_HARDWARE.to_string(),
            line => line.to_string(),
        };

        let listing = parse_node_listing(&self.required(&self.config.nodes_command).await?)?;
        let up = parse_up_nodes(&self.required(&self.config.up_nodes_command).await?);

        let mut nodes = BTreeMap::new();
        for (lnn, id, hostname, ip_address) in listing {
            if self.single_node && lnn != local_lnn {
                continue;
            }
            let status = if up.contains(&id) {
                NodeStatus::Online
            } else {
                self.probe_down_node(lnn).await
            };
            nodes.insert(
                lnn,
                Node {
                    lnn,
                    id,
                    hostname,
                    ip_address,
                    status,
                },
            );
        }

        if self.single_node && nodes.is_empty() {
            return Err(ClusterCheckError::Discovery(format!(
                "local node {} is missing from the node listing",
                local_lnn
            )));
        }

        let snapshot = ClusterSnapshot {
            name,
            software_version,
            build,
            hardware,
            local_lnn,
            nodes,
        };
        debug!(
            "Cluster {}: online {:?}, offline {:?}, unmounted {:?}",
            snapshot.name,
            snapshot.online(),
            snapshot.offline(),
            snapshot.unmounted()
        );
        Ok(snapshot)
    }
}
