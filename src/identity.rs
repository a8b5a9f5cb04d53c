// src/identity.rs
//
// Device identities: the fixed set of names a device node may be admitted as.
// A node maps to an identity either by its name under the device directory
// or, for USB serial adapters, by the vendor/product ids sysfs reports for it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::SettingsError;

/// Stable name of a sensor device. Only obtainable from an [`IdentitySet`],
/// so every identity in flight is one the configuration knows about.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(Arc<str>);

impl DeviceIdentity {
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a device node is matched to an identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityRule {
    /// Node name under the device directory, e.g. `Onion1`
    Node(String),
    /// USB vendor/product id pair
    Usb { vendor_id: u16, product_id: u16 },
}

#[derive(Clone, Debug)]
struct Entry {
    identity: DeviceIdentity,
    rule: IdentityRule,
}

/// The configured identities. Fixed at startup.
#[derive(Clone, Debug)]
pub struct IdentitySet {
    entries: Vec<Entry>,
}

impl Default for IdentitySet {
    /// `Onion1`..`Onion4`, matched by node name
    fn default() -> Self {
        IdentitySet {
            entries: (1..=4)
                .map(|i| {
                    let name = format!("Onion{}", i);
                    Entry {
                        identity: DeviceIdentity(Arc::from(name.as_str())),
                        rule: IdentityRule::Node(name),
                    }
                })
                .collect(),
        }
    }
}

impl IdentitySet {
    pub fn new<I>(rules: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, IdentityRule)>,
    {
        let mut entries: Vec<Entry> = Vec::new();
        for (name, rule) in rules {
            let name = name.trim();
            if name.is_empty() {
                return Err(SettingsError::invalid("devices", "identity name is empty"));
            }
            if entries.iter().any(|e| e.identity.name() == name) {
                return Err(SettingsError::invalid(
                    "devices",
                    format!("identity '{}' is listed twice", name),
                ));
            }
            if let IdentityRule::Node(node) = &rule {
                if node.is_empty() || node.contains('/') {
                    return Err(SettingsError::invalid(
                        "devices",
                        format!("identity '{}' has an invalid node name '{}'", name, node),
                    ));
                }
            }
            entries.push(Entry {
                identity: DeviceIdentity(Arc::from(name)),
                rule,
            });
        }
        if entries.is_empty() {
            return Err(SettingsError::invalid("devices", "no device identities configured"));
        }
        Ok(IdentitySet { entries })
    }

    /// Look up an identity by its configured name
    pub fn get(&self, name: &str) -> Option<&DeviceIdentity> {
        self.entries
            .iter()
            .map(|e| &e.identity)
            .find(|id| id.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DeviceIdentity, &IdentityRule)> {
        self.entries.iter().map(|e| (&e.identity, &e.rule))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_node(&self, node: &str) -> Option<&DeviceIdentity> {
        self.entries.iter().find_map(|e| match &e.rule {
            IdentityRule::Node(n) if n == node => Some(&e.identity),
            _ => None,
        })
    }

    pub fn by_usb(&self, vendor_id: u16, product_id: u16) -> Option<&DeviceIdentity> {
        self.entries.iter().find_map(|e| match e.rule {
            IdentityRule::Usb {
                vendor_id: v,
                product_id: p,
            } if v == vendor_id && p == product_id => Some(&e.identity),
            _ => None,
        })
    }

    /// True when some identity can only be resolved through sysfs
    pub fn needs_attributes(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.rule, IdentityRule::Usb { .. }))
    }

    /// Resolve a freshly seen node. Name rules win over attribute rules.
    pub fn resolve(&self, node: &str, sysfs_root: &Path) -> Option<DeviceIdentity> {
        if let Some(id) = self.by_node(node) {
            return Some(id.clone());
        }
        if !self.needs_attributes() {
            return None;
        }
        let (vendor_id, product_id) = usb_ids(sysfs_root, node)?;
        self.by_usb(vendor_id, product_id).cloned()
    }
}

/// Parse a hex id as written in settings files: `0403`, `0x0403`
pub fn parse_usb_id(text: &str) -> Option<u16> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u16::from_str_radix(digits, 16).ok()
}

/// USB vendor/product ids of a tty node, read from
/// `<sysfs_root>/class/tty/<node>/device` and its ancestors.
pub fn usb_ids(sysfs_root: &Path, node: &str) -> Option<(u16, u16)> {
    let device = sysfs_root.join("class/tty").join(node).join("device");
    let device = std::fs::canonicalize(device).ok()?;
    let root = std::fs::canonicalize(sysfs_root).ok()?;

    for dir in device.ancestors() {
        if !dir.starts_with(&root) || dir == root {
            break;
        }
        let vendor = std::fs::read_to_string(dir.join("idVendor"));
        let product = std::fs::read_to_string(dir.join("idProduct"));
        if let (Ok(vendor), Ok(product)) = (vendor, product) {
            return Some((parse_usb_id(&vendor)?, parse_usb_id(&product)?));
        }
    }
    None
}
