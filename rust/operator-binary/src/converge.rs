//! Brings cluster objects in line with their desired state.
//!
//! The observed object is fetched and only the fields that differ from the desired object are
//! copied over before a single update. Server-managed fields like the resource version and status
//! survive.

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::{
            apps::v1::StatefulSet,
            core::v1::{ConfigMap, Service},
            policy::v1::PodDisruptionBudget,
        },
        NamespaceResourceScope,
    },
    kube::{self, api::PostParams, Api, Resource},
};

use crate::{
    crd::{service_monitor::ServiceMonitor, OPERATOR_NAME},
    quantity::same_quantity,
};

pub const FIELD_MANAGER: &str = OPERATOR_NAME;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("desired object has no name"))]
    ObjectHasNoName,

    #[snafu(display("failed to get {name}"))]
    GetObject { source: kube::Error, name: String },

    #[snafu(display("failed to create {name}"))]
    CreateObject { source: kube::Error, name: String },

    #[snafu(display("failed to update {name}"))]
    UpdateObject { source: kube::Error, name: String },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Read and write access to one kind of namespaced object.
///
/// A missing object is `Ok(None)`, every other failure is an error.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    async fn get_observed(&self, name: &str) -> Result<Option<K>, kube::Error>;
    async fn create_object(&self, obj: &K) -> Result<K, kube::Error>;
    async fn update_object(&self, obj: &K) -> Result<K, kube::Error>;
}

#[async_trait]
impl<K> ObjectStore<K> for Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get_observed(&self, name: &str) -> Result<Option<K>, kube::Error> {
        self.get_opt(name).await
    }

    async fn create_object(&self, obj: &K) -> Result<K, kube::Error> {
        self.create(&post_params(), obj).await
    }

    async fn update_object(&self, obj: &K) -> Result<K, kube::Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.replace(&name, &post_params(), obj).await
    }
}

fn post_params() -> PostParams {
    PostParams {
        dry_run: false,
        field_manager: Some(FIELD_MANAGER.to_string()),
    }
}

/// Objects whose significant fields can be copied from a desired instance.
pub trait Convergent {
    /// Copies every significant field of `desired` that differs into `self` and returns the
    /// names of the copied fields.
    fn converge_from(&mut self, desired: &Self) -> Vec<&'static str>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Updated(Vec<&'static str>),
    Unchanged,
}

pub async fn converge<K, S>(store: &S, desired: &K) -> Result<Outcome>
where
    K: Resource + Convergent + Clone + Send + Sync,
    K::DynamicType: Default,
    S: ObjectStore<K> + ?Sized,
{
    let name = desired.meta().name.clone().context(ObjectHasNoNameSnafu)?;
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let display_name = format!("{kind} {name}");

    let Some(mut observed) = store
        .get_observed(&name)
        .await
        .context(GetObjectSnafu {
            name: display_name.clone(),
        })?
    else {
        tracing::info!(object.kind = %kind, object.name = %name, "creating object");
        store.create_object(desired).await.context(CreateObjectSnafu {
            name: display_name,
        })?;
        return Ok(Outcome::Created);
    };

    let changed = observed.converge_from(desired);
    if changed.is_empty() {
        tracing::debug!(object.kind = %kind, object.name = %name, "object is up to date");
        return Ok(Outcome::Unchanged);
    }

    tracing::info!(
        object.kind = %kind,
        object.name = %name,
        fields = ?changed,
        "updating object"
    );
    store
        .update_object(&observed)
        .await
        .context(UpdateObjectSnafu { name: display_name })?;
    Ok(Outcome::Updated(changed))
}

/// Replaces `observed` with `desired` unless both are equal.
fn sync_exact<T: Clone + PartialEq>(
    field: &'static str,
    observed: &mut T,
    desired: &T,
    changed: &mut Vec<&'static str>,
) {
    if observed != desired {
        *observed = desired.clone();
        changed.push(field);
    }
}

/// Replaces `observed` with `desired` unless both describe the same object once the values
/// the API server fills in (defaulted protocols, pull policies, ...) are ignored.
fn sync_ignoring_defaults<T: Clone + Serialize>(
    field: &'static str,
    observed: &mut T,
    desired: &T,
    changed: &mut Vec<&'static str>,
) {
    let matches = match (serde_json::to_value(&*observed), serde_json::to_value(desired)) {
        (Ok(observed), Ok(desired)) => matches_desired(&desired, &observed),
        _ => false,
    };
    if !matches {
        *observed = desired.clone();
        changed.push(field);
    }
}

/// Keys the API server sets when they are left out. An observed value for one of these is only
/// compared when the desired object sets it as well.
const SERVER_DEFAULTED_FIELDS: &[&str] = &[
    "apiVersion",
    "creationTimestamp",
    "defaultMode",
    "dnsPolicy",
    "enableServiceLinks",
    "failureThreshold",
    "imagePullPolicy",
    "nodePort",
    "periodSeconds",
    "protocol",
    "restartPolicy",
    "schedulerName",
    "securityContext",
    "serviceAccount",
    "successThreshold",
    "targetPort",
    "terminationGracePeriodSeconds",
    "terminationMessagePath",
    "terminationMessagePolicy",
    "timeoutSeconds",
];

/// Keys holding maps of resource quantities, which the API server may rewrite in canonical form.
const QUANTITY_FIELDS: &[&str] = &["limits", "requests"];

/// Whether `observed` has exactly the content of `desired`, apart from server defaulted keys.
fn matches_desired(desired: &serde_json::Value, observed: &serde_json::Value) -> bool {
    use serde_json::Value;

    match (desired, observed) {
        (Value::Object(desired), Value::Object(observed)) => {
            let desired_present = desired.iter().all(|(key, value)| {
                if is_unset(value) {
                    return observed.get(key).map_or(true, is_unset);
                }
                observed.get(key).is_some_and(|observed| {
                    if QUANTITY_FIELDS.contains(&key.as_str()) {
                        quantities_match(value, observed)
                    } else {
                        matches_desired(value, observed)
                    }
                })
            });
            let nothing_extra = observed.iter().all(|(key, value)| {
                is_unset(value)
                    || desired.get(key).is_some_and(|desired| !is_unset(desired))
                    || SERVER_DEFAULTED_FIELDS.contains(&key.as_str())
            });
            desired_present && nothing_extra
        }
        (Value::Array(desired), Value::Array(observed)) => {
            desired.len() == observed.len()
                && desired
                    .iter()
                    .zip(observed)
                    .all(|(desired, observed)| matches_desired(desired, observed))
        }
        (desired, observed) if is_unset(desired) => is_unset(observed),
        (desired, observed) => desired == observed,
    }
}

fn is_unset(value: &serde_json::Value) -> bool {
    use serde_json::Value;

    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn quantities_match(desired: &serde_json::Value, observed: &serde_json::Value) -> bool {
    match (desired.as_object(), observed.as_object()) {
        (Some(desired), Some(observed)) => {
            desired.len() == observed.len()
                && desired.iter().all(|(resource, value)| {
                    match (value.as_str(), observed.get(resource).and_then(|v| v.as_str())) {
                        (Some(desired), Some(observed)) => same_quantity(desired, observed),
                        _ => false,
                    }
                })
        }
        _ => matches_desired(desired, observed),
    }
}

impl Convergent for StatefulSet {
    fn converge_from(&mut self, desired: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        sync_exact(
            "labels",
            &mut self.metadata.labels,
            &desired.metadata.labels,
            &mut changed,
        );
        match (&mut self.spec, &desired.spec) {
            (Some(observed), Some(desired)) => {
                sync_exact(
                    "replicas",
                    &mut observed.replicas,
                    &desired.replicas,
                    &mut changed,
                );
                sync_ignoring_defaults(
                    "template",
                    &mut observed.template,
                    &desired.template,
                    &mut changed,
                );
            }
            (observed, desired) => sync_exact("spec", observed, desired, &mut changed),
        }
        changed
    }
}

impl Convergent for Service {
    fn converge_from(&mut self, desired: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        sync_exact(
            "labels",
            &mut self.metadata.labels,
            &desired.metadata.labels,
            &mut changed,
        );
        match (&mut self.spec, &desired.spec) {
            (Some(observed), Some(desired)) => {
                sync_ignoring_defaults("ports", &mut observed.ports, &desired.ports, &mut changed);
                sync_exact(
                    "selector",
                    &mut observed.selector,
                    &desired.selector,
                    &mut changed,
                );
                sync_exact(
                    "publishNotReadyAddresses",
                    &mut observed.publish_not_ready_addresses,
                    &desired.publish_not_ready_addresses,
                    &mut changed,
                );
            }
            (observed, desired) => sync_exact("spec", observed, desired, &mut changed),
        }
        changed
    }
}

impl Convergent for ConfigMap {
    fn converge_from(&mut self, desired: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        sync_exact(
            "labels",
            &mut self.metadata.labels,
            &desired.metadata.labels,
            &mut changed,
        );
        sync_exact("data", &mut self.data, &desired.data, &mut changed);
        changed
    }
}

impl Convergent for PodDisruptionBudget {
    fn converge_from(&mut self, desired: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        sync_exact(
            "labels",
            &mut self.metadata.labels,
            &desired.metadata.labels,
            &mut changed,
        );
        match (&mut self.spec, &desired.spec) {
            (Some(observed), Some(desired)) => {
                sync_exact(
                    "selector",
                    &mut observed.selector,
                    &desired.selector,
                    &mut changed,
                );
                sync_exact(
                    "minAvailable",
                    &mut observed.min_available,
                    &desired.min_available,
                    &mut changed,
                );
                sync_exact(
                    "maxUnavailable",
                    &mut observed.max_unavailable,
                    &desired.max_unavailable,
                    &mut changed,
                );
            }
            (observed, desired) => sync_exact("spec", observed, desired, &mut changed),
        }
        changed
    }
}

impl Convergent for ServiceMonitor {
    fn converge_from(&mut self, desired: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        sync_exact(
            "labels",
            &mut self.metadata.labels,
            &desired.metadata.labels,
            &mut changed,
        );
        sync_exact("spec", &mut self.spec, &desired.spec, &mut changed);
        changed
    }
}
