use super::MANAGER_NAME;
use k8s_openapi::{apimachinery::pkg::apis::meta::v1::Time, jiff::Timestamp};
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::ClusterResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, fmt::Debug};
use stratus_types::*;

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    /// Sets the last updated timestamp to the given value.
    fn set_last_updated(&mut self, last_updated: Time);
}

impl Object<NodeClaimStatus> for NodeClaim {
    fn mut_status(&mut self) -> &mut NodeClaimStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for NodeClaimStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

impl Object<NodePoolStatus> for NodePool {
    fn mut_status(&mut self) -> &mut NodePoolStatus {
        self.status.get_or_insert_with(Default::default)
    }
}

impl Status for NodePoolStatus {
    fn set_last_updated(&mut self, last_updated: Time) {
        self.last_updated = Some(last_updated);
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = ClusterResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        let status = modified.mut_status();
        f(status);
        status.set_last_updated(Time::from(Timestamp::now()));
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let api: Api<T> = Api::all(client);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

/// Patch the resource's metadata/spec with the provided function, leaving
/// status untouched. Used to stamp resolved labels onto claims at launch.
pub async fn patch_resource<T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut T),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = ClusterResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        f(&mut modified);
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let api: Api<T> = Api::all(client);
    api.patch(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}
