//! Keeps the policies of a running cluster equal to the declared ones.
//!
//! Policies are identified by `(vhost, name)`. Remote policies that are not declared are removed
//! first, then every declared policy is written, whether it changed or not.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ResultExt, Snafu};

use crate::{
    crd::RabbitmqPolicy,
    management_api::{self, ManagementClient, PolicyBody},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to list policies"))]
    ListPolicies { source: management_api::Error },

    #[snafu(display("failed to delete policy {name:?} in vhost {vhost:?}"))]
    DeletePolicy {
        source: management_api::Error,
        vhost: String,
        name: String,
    },

    #[snafu(display("failed to apply policy {name:?} in vhost {vhost:?}"))]
    ApplyPolicy {
        source: management_api::Error,
        vhost: String,
        name: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// A policy's identity, with the vhost as its plain name.
pub type PolicyKey = (String, String);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PolicySyncReport {
    pub deleted: Vec<PolicyKey>,
    pub applied: Vec<PolicyKey>,
}

pub async fn sync_policies(
    client: &ManagementClient,
    default_vhost: &str,
    declared: &[RabbitmqPolicy],
) -> Result<PolicySyncReport> {
    let declared: BTreeMap<PolicyKey, &RabbitmqPolicy> = declared
        .iter()
        .map(|policy| (policy_key(policy, default_vhost), policy))
        .collect();

    let stale: BTreeSet<PolicyKey> = client
        .list_policies()
        .await
        .context(ListPoliciesSnafu)?
        .into_iter()
        .map(|remote| (remote.vhost, remote.name))
        .filter(|key| !declared.contains_key(key))
        .collect();

    let mut report = PolicySyncReport::default();

    for (vhost, name) in stale {
        tracing::info!(policy.vhost = %vhost, policy.name = %name, "deleting policy");
        client
            .delete_policy(&vhost, &name)
            .await
            .context(DeletePolicySnafu {
                vhost: &vhost,
                name: &name,
            })?;
        report.deleted.push((vhost, name));
    }

    for ((vhost, name), policy) in declared {
        tracing::debug!(policy.vhost = %vhost, policy.name = %name, "applying policy");
        let body = PolicyBody {
            pattern: policy.pattern.clone(),
            definition: policy.definition.clone(),
            priority: policy.priority,
            apply_to: policy.apply_to.clone(),
        };
        client
            .put_policy(&vhost, &name, &body)
            .await
            .context(ApplyPolicySnafu {
                vhost: &vhost,
                name: &name,
            })?;
        report.applied.push((vhost, name));
    }

    Ok(report)
}

/// Policies without a vhost belong to the default vhost of the cluster, `/` if that is empty too.
fn policy_key(policy: &RabbitmqPolicy, default_vhost: &str) -> PolicyKey {
    let vhost = [policy.vhost.as_deref().unwrap_or_default(), default_vhost]
        .into_iter()
        .find(|vhost| !vhost.is_empty())
        .unwrap_or(crate::crd::DEFAULT_VHOST);
    (vhost.to_string(), policy.name.clone())
}
