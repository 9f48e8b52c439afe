//! Shared controller helpers.

use kube::api::{Patch, PatchParams};
use kube::{Api, Resource, ResourceExt};
use serde::de::DeserializeOwned;

use crate::controller::error::Result;

/// Add a finalizer to a resource unless it is already there.
pub async fn add_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<()>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = api.get(name).await?;
    let mut finalizers = resource.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, name, finalizers).await
}

/// Remove a finalizer from a resource. A deleted resource is fine.
pub async fn remove_finalizer<T>(api: &Api<T>, name: &str, finalizer: &str) -> Result<()>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let resource = match api.get(name).await {
        Ok(r) => r,
        Err(kube::Error::Api(e)) if e.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let before = resource.finalizers().len();
    let finalizers: Vec<String> = resource
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect();
    if finalizers.len() == before {
        return Ok(());
    }
    patch_finalizers(api, name, finalizers).await
}

async fn patch_finalizers<T>(api: &Api<T>, name: &str, finalizers: Vec<String>) -> Result<()>
where
    T: Resource + Clone + DeserializeOwned + std::fmt::Debug,
    <T as Resource>::DynamicType: Default,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
