use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a discovered device, unique within a registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        DeviceId(value)
    }
}

/// Capability tag advertised by a device ("audio", "video", ...).
///
/// Purely informational: the registry never enforces capabilities.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub String);

impl Capability {
    pub const AUDIO: &'static str = "audio";
    pub const VIDEO: &'static str = "video";
    pub const IMAGE: &'static str = "image";

    pub fn new(tag: impl Into<String>) -> Self {
        Capability(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(value: &str) -> Self {
        Capability(value.to_string())
    }
}

/// Adapter-private connection details; the registry never inspects them.
pub type TransportInfo = BTreeMap<String, serde_json::Value>;

/// A renderer discovered by one of the backends.
///
/// Devices are plain values: an update replaces the whole record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub model: Option<String>,
    /// Name of the backend owning the device, used to route `send_media`.
    pub transport: String,
    pub capabilities: BTreeSet<Capability>,
    pub transport_info: TransportInfo,
}

impl Device {
    pub fn new(
        id: impl Into<DeviceId>,
        name: impl Into<String>,
        transport: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: None,
            transport: transport.into(),
            capabilities: BTreeSet::new(),
            transport_info: TransportInfo::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_capability(mut self, capability: impl Into<Capability>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn with_transport_info(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.transport_info.insert(key.into(), value.into());
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capabilities.iter().any(|c| c.as_str() == tag)
    }

    /// Names of the attributes whose values differ between `self` and `other`.
    ///
    /// The id is the catalog key and is not compared.
    pub fn changed_fields(&self, other: &Device) -> BTreeSet<String> {
        let mut changes = BTreeSet::new();
        if self.name != other.name {
            changes.insert("name".to_string());
        }
        if self.model != other.model {
            changes.insert("model".to_string());
        }
        if self.transport != other.transport {
            changes.insert("transport".to_string());
        }
        if self.capabilities != other.capabilities {
            changes.insert("capabilities".to_string());
        }
        if self.transport_info != other.transport_info {
            changes.insert("transport_info".to_string());
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kitchen() -> Device {
        Device::new("dev1", "Kitchen", "dlna")
            .with_model("Speaker One")
            .with_capability(Capability::AUDIO)
            .with_transport_info("location", "http://192.168.1.10:1400/desc.xml")
    }

    #[test]
    fn test_identical_devices_have_no_changes() {
        assert!(kitchen().changed_fields(&kitchen()).is_empty());
    }

    #[test]
    fn test_changed_fields_lists_every_difference() {
        let mut renamed = kitchen();
        renamed.name = "Living room".into();
        renamed.capabilities.insert(Capability::from(Capability::VIDEO));
        renamed
            .transport_info
            .insert("location".into(), "http://192.168.1.11:1400/desc.xml".into());

        let changes = kitchen().changed_fields(&renamed);

        let expected: BTreeSet<String> = ["capabilities", "name", "transport_info"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(changes, expected);
    }

    #[test]
    fn test_model_removal_is_a_change() {
        let mut anonymous = kitchen();
        anonymous.model = None;

        assert!(kitchen().changed_fields(&anonymous).contains("model"));
    }

    #[test]
    fn test_has_capability() {
        let device = kitchen();
        assert!(device.has_capability("audio"));
        assert!(!device.has_capability("video"));
    }
}
