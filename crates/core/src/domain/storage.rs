//! Persistent storage configuration and its OpenEBS node disk manager rendering.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::CoreError;

pub const KIND_PERSISTENT_STORAGE: &str = "PersistentStorage";
pub const KIND_CONFIG_MAP: &str = "ConfigMap";
pub const OPENEBS_NAMESPACE: &str = "openebs";
pub const NDM_CONFIG_MAP: &str = "openebs-ndm-config";
pub const NDM_CONFIG_KEY: &str = "node-disk-manager.config";

const RESOURCE_VERSION: &str = "v1";
const DEFAULT_NAMESPACE: &str = "default";
const NDM_COMPONENT_LABEL: &str = "openebs.io/component-name";
const NDM_COMPONENT: &str = "ndm-config";

const MOUNT_FILTER: &str = "os-disk-exclude-filter";
const VENDOR_FILTER: &str = "vendor-filter";
const PATH_FILTER: &str = "path-filter";

const DEFAULT_MOUNT_EXCLUDES: &[&str] = &["/", "/etc/hosts", "/boot"];
const DEFAULT_VENDOR_EXCLUDES: &[&str] = &["CLOUDBYT", "OpenEBS"];
const DEFAULT_DEVICE_EXCLUDES: &[&str] = &[
    "loop", "/dev/fd0", "/dev/sr0", "/dev/ram", "/dev/dm-", "/dev/md",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ResourceMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OpenEbsFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpenEbsFilters {
    #[serde(default)]
    pub mount_points: OpenEbsFilter,
    #[serde(default)]
    pub vendors: OpenEbsFilter,
    #[serde(default)]
    pub devices: OpenEbsFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct OpenEbs {
    #[serde(default)]
    pub filters: OpenEbsFilters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PersistentStorageSpec {
    #[serde(default)]
    pub openebs: OpenEbs,
}

/// Cluster-wide persistent storage resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistentStorage {
    pub kind: String,
    pub version: String,
    #[serde(default)]
    pub metadata: ResourceMetadata,
    #[serde(default)]
    pub spec: PersistentStorageSpec,
}

impl Default for PersistentStorage {
    fn default() -> Self {
        let mut storage = Self::new(PersistentStorageSpec::default());
        storage.check_and_set_defaults();
        storage
    }
}

impl PersistentStorage {
    pub fn new(spec: PersistentStorageSpec) -> Self {
        Self {
            kind: KIND_PERSISTENT_STORAGE.to_string(),
            version: RESOURCE_VERSION.to_string(),
            metadata: ResourceMetadata {
                name: KIND_PERSISTENT_STORAGE.to_string(),
                namespace: DEFAULT_NAMESPACE.to_string(),
            },
            spec,
        }
    }

    pub fn from_ndm_config(config: &NdmConfig) -> Self {
        Self::new(PersistentStorageSpec {
            openebs: OpenEbs {
                filters: OpenEbsFilters {
                    mount_points: OpenEbsFilter {
                        include: Vec::new(),
                        exclude: config.mount_excludes(),
                    },
                    vendors: OpenEbsFilter {
                        include: config.vendor_includes(),
                        exclude: config.vendor_excludes(),
                    },
                    devices: OpenEbsFilter {
                        include: config.device_includes(),
                        exclude: config.device_excludes(),
                    },
                },
            },
        })
    }

    /// Fills unset metadata and empty exclude lists with defaults.
    pub fn check_and_set_defaults(&mut self) {
        if self.metadata.name.is_empty() {
            self.metadata.name = KIND_PERSISTENT_STORAGE.to_string();
        }
        if self.metadata.namespace.is_empty() {
            self.metadata.namespace = DEFAULT_NAMESPACE.to_string();
        }
        let filters = &mut self.spec.openebs.filters;
        if filters.mount_points.exclude.is_empty() {
            filters.mount_points.exclude = to_strings(DEFAULT_MOUNT_EXCLUDES);
        }
        if filters.vendors.exclude.is_empty() {
            filters.vendors.exclude = to_strings(DEFAULT_VENDOR_EXCLUDES);
        }
        if filters.devices.exclude.is_empty() {
            filters.devices.exclude = to_strings(DEFAULT_DEVICE_EXCLUDES);
        }
    }

    pub fn mount_excludes(&self) -> &[String] {
        &self.spec.openebs.filters.mount_points.exclude
    }

    pub fn vendor_includes(&self) -> &[String] {
        &self.spec.openebs.filters.vendors.include
    }

    pub fn vendor_excludes(&self) -> &[String] {
        &self.spec.openebs.filters.vendors.exclude
    }

    pub fn device_includes(&self) -> &[String] {
        &self.spec.openebs.filters.devices.include
    }

    pub fn device_excludes(&self) -> &[String] {
        &self.spec.openebs.filters.devices.exclude
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NdmProbe {
    pub name: String,
    pub key: String,
    pub state: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NdmFilter {
    pub name: String,
    pub key: String,
    pub state: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub include: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exclude: String,
}

impl NdmFilter {
    fn new(name: &str, key: &str, exclude: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            key: key.to_string(),
            state: true,
            include: String::new(),
            exclude: exclude.join(","),
        }
    }
}

/// Node disk manager configuration as stored in its config map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NdmConfig {
    #[serde(rename = "probeconfigs", default)]
    pub probe_configs: Vec<NdmProbe>,
    #[serde(rename = "filterconfigs", default)]
    pub filter_configs: Vec<NdmFilter>,
}

impl Default for NdmConfig {
    fn default() -> Self {
        let probe = |name: &str, key: &str, state: bool| NdmProbe {
            name: name.to_string(),
            key: key.to_string(),
            state,
        };
        Self {
            probe_configs: vec![
                probe("udev probe", "udev-probe", true),
                probe("searchest probe", "searchest-probe", false),
                probe("smart probe", "smart-probe", true),
            ],
            filter_configs: vec![
                NdmFilter::new("os disk exclude filter", MOUNT_FILTER, DEFAULT_MOUNT_EXCLUDES),
                NdmFilter::new("vendor filter", VENDOR_FILTER, DEFAULT_VENDOR_EXCLUDES),
                NdmFilter::new("path filter", PATH_FILTER, DEFAULT_DEVICE_EXCLUDES),
            ],
        }
    }
}

impl NdmConfig {
    pub fn from_config_map(map: &ConfigMap) -> Result<Self, CoreError> {
        let data = map
            .data
            .get(NDM_CONFIG_KEY)
            .filter(|data| !data.is_empty())
            .ok_or_else(|| {
                CoreError::BadParameter(format!(
                    "config map {} does not contain node disk manager configuration",
                    map.metadata.name
                ))
            })?;
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn to_config_map(&self) -> Result<ConfigMap, CoreError> {
        let data = serde_yaml::to_string(self)?;
        let mut map = ConfigMap::new(OPENEBS_NAMESPACE, NDM_CONFIG_MAP);
        map.metadata
            .labels
            .insert(NDM_COMPONENT_LABEL.to_string(), NDM_COMPONENT.to_string());
        map.data.insert(NDM_CONFIG_KEY.to_string(), data);
        Ok(map)
    }

    /// Overrides filters with the values from a persistent storage resource.
    pub fn apply(&mut self, storage: &PersistentStorage) {
        self.set_mount_excludes(storage.mount_excludes());
        self.set_vendor_includes(storage.vendor_includes());
        self.set_vendor_excludes(storage.vendor_excludes());
        self.set_device_includes(storage.device_includes());
        self.set_device_excludes(storage.device_excludes());
    }

    pub fn mount_excludes(&self) -> Vec<String> {
        self.filter(MOUNT_FILTER).map(|f| split(&f.exclude)).unwrap_or_default()
    }

    pub fn set_mount_excludes(&mut self, excludes: &[String]) {
        self.filter_mut(MOUNT_FILTER).exclude = excludes.join(",");
    }

    pub fn vendor_includes(&self) -> Vec<String> {
        self.filter(VENDOR_FILTER).map(|f| split(&f.include)).unwrap_or_default()
    }

    pub fn set_vendor_includes(&mut self, includes: &[String]) {
        self.filter_mut(VENDOR_FILTER).include = includes.join(",");
    }

    pub fn vendor_excludes(&self) -> Vec<String> {
        self.filter(VENDOR_FILTER).map(|f| split(&f.exclude)).unwrap_or_default()
    }

    pub fn set_vendor_excludes(&mut self, excludes: &[String]) {
        self.filter_mut(VENDOR_FILTER).exclude = excludes.join(",");
    }

    pub fn device_includes(&self) -> Vec<String> {
        self.filter(PATH_FILTER).map(|f| split(&f.include)).unwrap_or_default()
    }

    pub fn set_device_includes(&mut self, includes: &[String]) {
        self.filter_mut(PATH_FILTER).include = includes.join(",");
    }

    pub fn device_excludes(&self) -> Vec<String> {
        self.filter(PATH_FILTER).map(|f| split(&f.exclude)).unwrap_or_default()
    }

    pub fn set_device_excludes(&mut self, excludes: &[String]) {
        self.filter_mut(PATH_FILTER).exclude = excludes.join(",");
    }

    fn filter(&self, key: &str) -> Option<&NdmFilter> {
        self.filter_configs.iter().find(|f| f.key == key)
    }

    fn filter_mut(&mut self, key: &str) -> &mut NdmFilter {
        let index = match self.filter_configs.iter().position(|f| f.key == key) {
            Some(index) => index,
            None => {
                self.filter_configs
                    .push(NdmFilter::new(&key.replace('-', " "), key, &[]));
                self.filter_configs.len() - 1
            }
        };
        &mut self.filter_configs[index]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Kubernetes config map in its API wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl ConfigMap {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: RESOURCE_VERSION.to_string(),
            kind: KIND_CONFIG_MAP.to_string(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                labels: BTreeMap::new(),
            },
            data: BTreeMap::new(),
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn split(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }
    value.split(',').map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_persistent_storage() {
        let storage = PersistentStorage::default();
        assert_eq!(storage.kind, KIND_PERSISTENT_STORAGE);
        assert_eq!(storage.metadata.name, KIND_PERSISTENT_STORAGE);
        assert_eq!(storage.mount_excludes(), ["/", "/etc/hosts", "/boot"]);
        assert_eq!(storage.vendor_excludes(), ["CLOUDBYT", "OpenEBS"]);
        assert_eq!(storage.device_excludes().len(), 6);
        assert!(storage.vendor_includes().is_empty());
    }

    #[test]
    fn test_defaults_do_not_override_explicit_values() {
        let mut storage = PersistentStorage::new(PersistentStorageSpec::default());
        storage.spec.openebs.filters.devices.exclude = vec!["/dev/sdb".to_string()];
        storage.check_and_set_defaults();

        assert_eq!(storage.device_excludes(), ["/dev/sdb"]);
        assert_eq!(storage.vendor_excludes(), ["CLOUDBYT", "OpenEBS"]);
    }

    #[test]
    fn test_persistent_storage_json_shape() {
        let json = r#"{
            "kind": "PersistentStorage",
            "version": "v1",
            "metadata": {"name": "PersistentStorage"},
            "spec": {"openebs": {"filters": {
                "mountPoints": {"exclude": ["/data"]},
                "vendors": {"include": ["Samsung"]},
                "devices": {"include": ["/dev/sdc"]}
            }}}
        }"#;
        let storage: PersistentStorage = serde_json::from_str(json).unwrap();
        assert_eq!(storage.mount_excludes(), ["/data"]);
        assert_eq!(storage.vendor_includes(), ["Samsung"]);
        assert_eq!(storage.device_includes(), ["/dev/sdc"]);
    }

    #[test]
    fn test_ndm_config_apply() {
        let mut storage = PersistentStorage::default();
        storage.spec.openebs.filters.vendors.include = vec!["Samsung".to_string(), "Intel".to_string()];
        storage.spec.openebs.filters.devices.exclude = vec!["loop".to_string()];

        let mut config = NdmConfig::default();
        config.apply(&storage);

        assert_eq!(config.vendor_includes(), vec!["Samsung", "Intel"]);
        assert_eq!(config.device_excludes(), vec!["loop"]);
        assert_eq!(config.mount_excludes(), vec!["/", "/etc/hosts", "/boot"]);
        assert!(config.device_includes().is_empty());
    }

    #[test]
    fn test_ndm_config_map() {
        let config = NdmConfig::default();
        let map = config.to_config_map().unwrap();

        assert_eq!(map.metadata.name, NDM_CONFIG_MAP);
        assert_eq!(map.metadata.namespace, OPENEBS_NAMESPACE);
        assert_eq!(
            map.metadata.labels.get("openebs.io/component-name").map(String::as_str),
            Some("ndm-config")
        );
        let data = map.data.get(NDM_CONFIG_KEY).unwrap();
        assert!(data.contains("probeconfigs"));
        assert!(data.contains("os-disk-exclude-filter"));

        let parsed = NdmConfig::from_config_map(&map).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(
            PersistentStorage::from_ndm_config(&parsed),
            PersistentStorage::default()
        );
    }

    #[test]
    fn test_config_map_without_ndm_key_is_rejected() {
        let map = ConfigMap::new(OPENEBS_NAMESPACE, "other");
        let err = NdmConfig::from_config_map(&map).unwrap_err();
        assert!(matches!(err, CoreError::BadParameter(_)));
        assert!(err.to_string().contains("other"));
    }

    #[test]
    fn test_config_map_wire_shape() {
        let map = ConfigMap::new("kube-system", "settings");
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["apiVersion"], "v1");
        assert_eq!(json["kind"], "ConfigMap");
        assert_eq!(json["metadata"]["namespace"], "kube-system");
    }
}
