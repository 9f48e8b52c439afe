//! ConfigMap generation.
//!
//! ClickHouse reads additional XML files from `config.d`, `users.d` and
//! `conf.d`. Each installation gets two shared ConfigMaps (server config and
//! users) and every host gets its own ConfigMap with macros.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::OperatorConfig;
use crate::model::namer;
use crate::model::topology::{Host, NormalizedChi};
use crate::resources::common::{chi_labels, host_labels, owner_references};

pub const CONFIGD_PATH: &str = "/etc/clickhouse-server/config.d/";
pub const USERSD_PATH: &str = "/etc/clickhouse-server/users.d/";
pub const CONFD_PATH: &str = "/etc/clickhouse-server/conf.d/";

pub const REMOTE_SERVERS_FILE: &str = "chop-generated-remote_servers.xml";
pub const ZOOKEEPER_FILE: &str = "chop-generated-zookeeper.xml";
pub const SETTINGS_FILE: &str = "chop-generated-settings.xml";
pub const USERS_FILE: &str = "chop-generated-users.xml";
pub const PROFILES_FILE: &str = "chop-generated-profiles.xml";
pub const QUOTAS_FILE: &str = "chop-generated-quotas.xml";
pub const MACROS_FILE: &str = "chop-generated-macros.xml";

const ROOT: &str = "yandex";

/// Server config shared by every host: remote servers, zookeeper, settings.
pub fn common_config_map(chi: &NormalizedChi, config: &OperatorConfig) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(REMOTE_SERVERS_FILE.to_string(), remote_servers_xml(chi));
    if !chi.zookeeper.nodes.is_empty() {
        data.insert(ZOOKEEPER_FILE.to_string(), zookeeper_xml(chi));
    }

    let mut settings = config.settings.clone();
    settings.extend(chi.settings.clone());
    data.insert(SETTINGS_FILE.to_string(), flat_xml(None, &settings));

    config_map(namer::common_config_map_name(&chi.name), chi, chi_labels(&chi.name), data)
}

/// Users, profiles and quotas shared by every host.
pub fn users_config_map(chi: &NormalizedChi, config: &OperatorConfig) -> ConfigMap {
    let data = BTreeMap::from([
        (USERS_FILE.to_string(), users_xml(chi, config)),
        (
            PROFILES_FILE.to_string(),
            flat_xml(Some("profiles"), &chi.profiles),
        ),
        (QUOTAS_FILE.to_string(), flat_xml(Some("quotas"), &chi.quotas)),
    ]);
    config_map(namer::users_config_map_name(&chi.name), chi, chi_labels(&chi.name), data)
}

/// Per-host macros.
pub fn host_config_map(chi: &NormalizedChi, host: &Host) -> ConfigMap {
    let data = BTreeMap::from([(MACROS_FILE.to_string(), macros_xml(chi, host))]);
    config_map(
        namer::host_config_map_name(&host.address),
        chi,
        host_labels(&host.address),
        data,
    )
}

fn config_map(
    name: String,
    chi: &NormalizedChi,
    labels: BTreeMap<String, String>,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(chi.namespace.clone()),
            labels: Some(labels),
            owner_references: owner_references(chi),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Minimal indenting XML writer.
struct Xml {
    out: String,
    depth: usize,
}

impl Xml {
    fn new() -> Self {
        let mut xml = Self {
            out: String::new(),
            depth: 0,
        };
        xml.open(ROOT);
        xml
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("    ");
        }
    }

    fn open(&mut self, tag: &str) {
        self.open_with(tag, "");
    }

    fn open_with(&mut self, tag: &str, attributes: &str) {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push_str(attributes);
        self.out.push_str(">\n");
        self.depth += 1;
    }

    fn close(&mut self, tag: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.indent();
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push_str(">\n");
    }

    fn leaf(&mut self, tag: &str, value: &str) {
        self.indent();
        self.out.push('<');
        self.out.push_str(tag);
        self.out.push('>');
        self.out.push_str(&escape(value));
        self.out.push_str("</");
        self.out.push_str(tag);
        self.out.push_str(">\n");
    }

    fn finish(mut self) -> String {
        self.close(ROOT);
        self.out
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// `remote_servers` with one entry per cluster, shards in index order.
pub fn remote_servers_xml(chi: &NormalizedChi) -> String {
    let mut xml = Xml::new();
    xml.open("remote_servers");
    for cluster in &chi.clusters {
        xml.open(&cluster.address.cluster_name);
        for shard in &cluster.shards {
            xml.open("shard");
            xml.leaf("weight", &shard.weight.to_string());
            xml.leaf(
                "internal_replication",
                if shard.internal_replication {
                    "true"
                } else {
                    "false"
                },
            );
            for host in &shard.hosts {
                xml.open("replica");
                xml.leaf("host", &namer::host_fqdn(&host.address));
                xml.leaf("port", &host.port.to_string());
                xml.close("replica");
            }
            xml.close("shard");
        }
        xml.close(&cluster.address.cluster_name);
    }
    xml.close("remote_servers");
    xml.finish()
}

pub fn zookeeper_xml(chi: &NormalizedChi) -> String {
    let zookeeper = &chi.zookeeper;
    let mut xml = Xml::new();
    xml.open("zookeeper");
    for (index, node) in zookeeper.nodes.iter().enumerate() {
        xml.open_with("node", &format!(" index=\"{index}\""));
        xml.leaf("host", &node.host);
        xml.leaf("port", &node.port.to_string());
        xml.close("node");
    }
    if let Some(timeout) = zookeeper.session_timeout_ms {
        xml.leaf("session_timeout_ms", &timeout.to_string());
    }
    if let Some(root) = &zookeeper.root {
        xml.leaf("root", root);
    }
    xml.close("zookeeper");
    xml.open("distributed_ddl");
    xml.leaf("path", &format!("/clickhouse/{}/task_queue/ddl", chi.name));
    xml.close("distributed_ddl");
    xml.finish()
}

/// Macros used by replicated table engines on this host.
pub fn macros_xml(chi: &NormalizedChi, host: &Host) -> String {
    let address = &host.address;
    let mut xml = Xml::new();
    xml.open("macros");
    xml.leaf("installation", &chi.name);
    xml.leaf("cluster", &address.cluster_name);
    xml.leaf(&address.cluster_name, &address.cluster_name);
    xml.leaf("shard", &address.shard_index.to_string());
    xml.leaf(
        &format!("{}-shard", address.cluster_name),
        &address.shard_index.to_string(),
    );
    xml.leaf("replica", &namer::statefulset_name(address));
    xml.close("macros");
    xml.finish()
}

/// Users with operator defaults filled in, plus the operator's own user.
pub fn users_xml(chi: &NormalizedChi, config: &OperatorConfig) -> String {
    let mut entries: BTreeMap<String, Vec<String>> = chi
        .users
        .iter()
        .map(|(k, v)| (k.clone(), vec![v.clone()]))
        .collect();

    let user_names: Vec<String> = chi
        .users
        .keys()
        .filter_map(|k| k.split('/').next())
        .map(String::from)
        .collect();
    for user in user_names {
        let has = |entries: &BTreeMap<String, Vec<String>>, key: &str| {
            let prefix = format!("{user}/{key}");
            entries.keys().any(|k| k.starts_with(&prefix))
        };
        if !has(&entries, "profile") {
            entries.insert(format!("{user}/profile"), vec![config.default_profile.clone()]);
        }
        if !has(&entries, "quota") {
            entries.insert(format!("{user}/quota"), vec![config.default_quota.clone()]);
        }
        if !has(&entries, "networks") {
            entries.insert(format!("{user}/networks/ip"), config.default_networks.clone());
        }
        if !has(&entries, "password") {
            entries.insert(format!("{user}/password"), vec![config.default_password.clone()]);
        }
    }

    if !config.ch_username.is_empty() {
        let user = &config.ch_username;
        entries.insert(format!("{user}/password"), vec![config.ch_password.clone()]);
        entries.insert(format!("{user}/profile"), vec![config.default_profile.clone()]);
        entries.insert(format!("{user}/quota"), vec![config.default_quota.clone()]);
        entries.insert(format!("{user}/networks/ip"), vec!["::/0".to_string()]);
    }

    render_tree(Some("users"), &entries)
}

/// Render a flat `a/b/c: value` map as nested elements.
pub fn flat_xml(section: Option<&str>, values: &BTreeMap<String, String>) -> String {
    let entries: BTreeMap<String, Vec<String>> = values
        .iter()
        .map(|(k, v)| (k.clone(), vec![v.clone()]))
        .collect();
    render_tree(section, &entries)
}

#[derive(Default)]
struct Node {
    values: Vec<String>,
    children: BTreeMap<String, Node>,
}

fn render_tree(section: Option<&str>, entries: &BTreeMap<String, Vec<String>>) -> String {
    let mut root = Node::default();
    for (path, values) in entries {
        let mut node = &mut root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = node.children.entry(part.to_string()).or_default();
        }
        node.values.extend(values.iter().cloned());
    }

    let mut xml = Xml::new();
    if let Some(section) = section {
        xml.open(section);
    }
    render_children(&mut xml, &root);
    if let Some(section) = section {
        xml.close(section);
    }
    xml.finish()
}

fn render_children(xml: &mut Xml, node: &Node) {
    for (tag, child) in &node.children {
        for value in &child.values {
            xml.leaf(tag, value);
        }
        if !child.children.is_empty() {
            xml.open(tag);
            render_children(xml, child);
            xml.close(tag);
        }
    }
}
