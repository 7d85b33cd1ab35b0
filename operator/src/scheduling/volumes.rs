use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::{CSINode, StorageClass};
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};

const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum VolumeError {
    #[error("storage class '{0}' does not exist")]
    MissingStorageClass(String),
    #[error("persistent volume claim '{0}' does not exist")]
    MissingClaim(String),
}

/// Prefetched view of the volume world: claims, storage classes, and
/// per-node CSI attach limits. Built once per scheduling round.
#[derive(Debug, Clone, Default)]
pub struct VolumeCatalog {
    // ns/name -> (storage class name, pre-bound volume name)
    pvcs: BTreeMap<String, (Option<String>, Option<String>)>,
    // storage class name -> provisioner driver
    storage_classes: BTreeMap<String, String>,
    default_storage_class: Option<String>,
    // node name -> driver -> max volumes
    csi_limits: BTreeMap<String, BTreeMap<String, i64>>,
}

impl VolumeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pvc(&mut self, pvc: &PersistentVolumeClaim) {
        let key = format!("{}/{}", pvc.namespace().unwrap_or_default(), pvc.name_any());
        let spec = pvc.spec.clone().unwrap_or_default();
        self.pvcs
            .insert(key, (spec.storage_class_name, spec.volume_name));
    }

    pub fn add_storage_class(&mut self, sc: &StorageClass) {
        let name = sc.name_any();
        if sc
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DEFAULT_CLASS_ANNOTATION))
            .is_some_and(|v| v == "true")
        {
            self.default_storage_class = Some(name.clone());
        }
        self.storage_classes.insert(name, sc.provisioner.clone());
    }

    pub fn add_csi_node(&mut self, csi_node: &CSINode) {
        let limits = self
            .csi_limits
            .entry(csi_node.name_any())
            .or_default();
        for driver in &csi_node.spec.drivers {
            if let Some(count) = driver.allocatable.as_ref().and_then(|a| a.count) {
                limits.insert(driver.name.clone(), count as i64);
            }
        }
    }

    pub fn limits_for_node(&self, node_name: &str) -> BTreeMap<String, i64> {
        self.csi_limits.get(node_name).cloned().unwrap_or_default()
    }

    fn driver_for_class(&self, class: &Option<String>) -> Result<Option<String>, VolumeError> {
        let name = match class {
            Some(name) => name.clone(),
            None => match &self.default_storage_class {
                Some(name) => name.clone(),
                // No class and no default: nothing will provision it.
                None => return Err(VolumeError::MissingStorageClass("(default)".to_string())),
            },
        };
        match self.storage_classes.get(&name) {
            Some(driver) => Ok(Some(driver.clone())),
            None => Err(VolumeError::MissingStorageClass(name)),
        }
    }

    /// Best-effort driver resolution for a volume id already mounted on a
    /// node, used to seed usage counts from the cluster state mirror.
    pub fn driver_for_claim(&self, id: &str) -> Option<String> {
        let (class, _) = self.pvcs.get(id)?;
        self.driver_for_class(class).ok().flatten()
    }

    /// The (driver, volume id) pairs the pod's volumes would consume on a
    /// node. Dynamic ephemeral volumes referencing a storage class that does
    /// not exist make the pod unschedulable.
    pub fn pod_volumes(&self, pod: &Pod) -> Result<Vec<(String, String)>, VolumeError> {
        let namespace = pod.namespace().unwrap_or_default();
        let mut out = Vec::new();
        let volumes = pod
            .spec
            .as_ref()
            .and_then(|s| s.volumes.as_deref())
            .unwrap_or(&[]);
        for volume in volumes {
            if let Some(pvc_source) = &volume.persistent_volume_claim {
                let key = format!("{}/{}", namespace, pvc_source.claim_name);
                let Some((class, prebound)) = self.pvcs.get(&key) else {
                    return Err(VolumeError::MissingClaim(key));
                };
                if prebound.is_some() && class.is_none() {
                    // Statically bound claims consume no dynamic driver slot
                    // we can account; the kubelet enforces those.
                    continue;
                }
                if let Some(driver) = self.driver_for_class(class)? {
                    out.push((driver, key));
                }
            } else if let Some(ephemeral) = &volume.ephemeral {
                let template = match ephemeral.volume_claim_template.as_ref() {
                    Some(t) => t,
                    None => continue,
                };
                let class = template.spec.storage_class_name.clone();
                if let Some(driver) = self.driver_for_class(&class)? {
                    out.push((
                        driver,
                        format!("{}/{}-{}", namespace, pod.name_any(), volume.name),
                    ));
                }
            }
        }
        Ok(out)
    }
}

/// Volumes in use on one (simulated) node, with per-driver limits.
#[derive(Debug, Clone, Default)]
pub struct VolumeUsage {
    in_use: BTreeMap<String, BTreeSet<String>>,
    limits: BTreeMap<String, i64>,
}

impl VolumeUsage {
    pub fn new(limits: BTreeMap<String, i64>) -> Self {
        VolumeUsage {
            in_use: BTreeMap::new(),
            limits,
        }
    }

    /// The driver whose limit the added volumes would exceed, if any.
    /// Volumes already mounted on the node do not count twice.
    pub fn exceeded_by(&self, volumes: &[(String, String)]) -> Option<String> {
        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for (driver, id) in volumes {
            if !self
                .in_use
                .get(driver)
                .is_some_and(|ids| ids.contains(id))
            {
                *counts.entry(driver.as_str()).or_insert(0) += 1;
            }
        }
        for (driver, added) in counts {
            if let Some(limit) = self.limits.get(driver) {
                let current = self.in_use.get(driver).map_or(0, |ids| ids.len() as i64);
                if current + added > *limit {
                    return Some(driver.to_string());
                }
            }
        }
        None
    }

    pub fn add(&mut self, volumes: impl IntoIterator<Item = (String, String)>) {
        for (driver, id) in volumes {
            self.in_use.entry(driver).or_default().insert(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        EphemeralVolumeSource, PersistentVolumeClaimSpec, PersistentVolumeClaimTemplate,
        PersistentVolumeClaimVolumeSource, PodSpec, Volume,
    };

    fn catalog_with_class(name: &str, driver: &str) -> VolumeCatalog {
        let mut catalog = VolumeCatalog::new();
        catalog.add_storage_class(&StorageClass {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: driver.to_string(),
            ..Default::default()
        });
        catalog
    }

    fn pod_with_ephemeral(class: Option<&str>) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "scratch".to_string(),
                    ephemeral: Some(EphemeralVolumeSource {
                        volume_claim_template: Some(PersistentVolumeClaimTemplate {
                            spec: PersistentVolumeClaimSpec {
                                storage_class_name: class.map(String::from),
                                ..Default::default()
                            },
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn missing_storage_class_makes_the_pod_unschedulable() {
        let catalog = catalog_with_class("standard", "ebs.csi.example.com");
        let err = catalog
            .pod_volumes(&pod_with_ephemeral(Some("nonexistent")))
            .unwrap_err();
        assert_eq!(err, VolumeError::MissingStorageClass("nonexistent".to_string()));
    }

    #[test]
    fn ephemeral_volumes_resolve_through_their_class() {
        let catalog = catalog_with_class("standard", "ebs.csi.example.com");
        let volumes = catalog
            .pod_volumes(&pod_with_ephemeral(Some("standard")))
            .unwrap();
        assert_eq!(
            volumes,
            vec![(
                "ebs.csi.example.com".to_string(),
                "default/p-scratch".to_string()
            )]
        );
    }

    #[test]
    fn missing_pvc_is_reported() {
        let catalog = catalog_with_class("standard", "ebs.csi.example.com");
        let pod = Pod {
            metadata: kube::api::ObjectMeta {
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                volumes: Some(vec![Volume {
                    name: "data".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: "ghost".to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            catalog.pod_volumes(&pod).unwrap_err(),
            VolumeError::MissingClaim("default/ghost".to_string())
        );
    }

    #[test]
    fn per_driver_limits_bound_added_volumes() {
        let mut usage = VolumeUsage::new(BTreeMap::from([(
            "ebs.csi.example.com".to_string(),
            2_i64,
        )]));
        usage.add([(
            "ebs.csi.example.com".to_string(),
            "default/a".to_string(),
        )]);
        // A second distinct volume fits, a third does not.
        let one = vec![("ebs.csi.example.com".to_string(), "default/b".to_string())];
        assert!(usage.exceeded_by(&one).is_none());
        usage.add(one);
        let another = vec![("ebs.csi.example.com".to_string(), "default/c".to_string())];
        assert_eq!(
            usage.exceeded_by(&another),
            Some("ebs.csi.example.com".to_string())
        );
        // Re-mounting an already-counted volume is free.
        let repeat = vec![("ebs.csi.example.com".to_string(), "default/a".to_string())];
        assert!(usage.exceeded_by(&repeat).is_none());
    }
}
