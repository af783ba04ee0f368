use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::PersistentVolumeClaim,
    kube::{
        self,
        api::{DeleteParams, ListParams},
        Api, ResourceExt,
    },
    kvp::LabelError,
};

use crate::{controller::selector_labels, crd::RabbitmqCluster};

/// Blocks deletion of a cluster until its data volumes have been dealt with.
pub const PVC_FINALIZER: &str = "rabbitmq.stackable.tech/pvc";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to build PersistentVolumeClaim selector"))]
    BuildLabel { source: LabelError },

    #[snafu(display("failed to list PersistentVolumeClaims matching {selector:?}"))]
    ListPvcs {
        source: kube::Error,
        selector: String,
    },

    #[snafu(display("failed to delete PersistentVolumeClaim {name}"))]
    DeletePvc { source: kube::Error, name: String },
}

/// Deletes the PersistentVolumeClaims the StatefulSet of `rabbitmq` created for its nodes and
/// returns their names.
pub async fn delete_dependent_pvcs(
    client: &kube::Client,
    namespace: &str,
    rabbitmq: &RabbitmqCluster,
) -> Result<Vec<String>, Error> {
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(client.clone(), namespace);
    let selector = pvc_label_selector(rabbitmq)?;
    let claims = pvcs
        .list(&ListParams::default().labels(&selector))
        .await
        .context(ListPvcsSnafu { selector: &selector })?;

    let mut deleted = Vec::new();
    for claim in claims {
        let name = claim.name_any();
        tracing::info!(pvc.name = %name, "deleting PersistentVolumeClaim");
        match pvcs.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 404 => {
                tracing::debug!(pvc.name = %name, "PersistentVolumeClaim is already gone");
            }
            Err(source) => return Err(source).context(DeletePvcSnafu { name }),
        }
        deleted.push(name);
    }
    Ok(deleted)
}

/// The data volume claims carry the pod selector labels of the cluster.
pub fn pvc_label_selector(rabbitmq: &RabbitmqCluster) -> Result<String, Error> {
    let labels: std::collections::BTreeMap<String, String> =
        selector_labels(rabbitmq).context(BuildLabelSnafu)?.into();
    Ok(labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::{
        crd::tests::minimal_cluster,
        statefulset::build_statefulset,
        test_utils::{kube_client, not_found_status},
    };

    const PVCS_PATH: &str = "/api/v1/namespaces/default/persistentvolumeclaims";

    fn pvc(name: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {"name": name, "namespace": "default"}
        })
    }

    /// Serves two claims of `rmq-test`, the second of which disappears before it is deleted.
    pub async fn mount_cluster_pvcs(server: &MockServer) {
        let selector = pvc_label_selector(&minimal_cluster()).unwrap();
        Mock::given(method("GET"))
            .and(path(PVCS_PATH))
            .and(query_param("labelSelector", selector.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaimList",
                "metadata": {"resourceVersion": "17"},
                "items": [pvc("data-rmq-test-0"), pvc("data-rmq-test-1")]
            })))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{PVCS_PATH}/data-rmq-test-0")))
            .respond_with(ResponseTemplate::new(200).set_body_json(pvc("data-rmq-test-0")))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path(format!("{PVCS_PATH}/data-rmq-test-1")))
            .respond_with(ResponseTemplate::new(404).set_body_json(not_found_status(
                "persistentvolumeclaims",
                "data-rmq-test-1",
            )))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_deletes_claims_and_ignores_missing_ones() {
        let server = MockServer::start().await;
        mount_cluster_pvcs(&server).await;

        let deleted = delete_dependent_pvcs(&kube_client(&server), "default", &minimal_cluster())
            .await
            .unwrap();
        assert_eq!(deleted, vec!["data-rmq-test-0", "data-rmq-test-1"]);
    }

    #[tokio::test]
    async fn test_failed_delete_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PVCS_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaimList",
                "metadata": {},
                "items": [pvc("data-rmq-test-0")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "forbidden",
                "reason": "Forbidden",
                "code": 403
            })))
            .mount(&server)
            .await;

        let err = delete_dependent_pvcs(&kube_client(&server), "default", &minimal_cluster())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeletePvc { name, .. } if name == "data-rmq-test-0"));
    }

    #[test]
    fn test_selector_matches_volume_claim_template() {
        let rabbitmq = minimal_cluster();
        let selector = pvc_label_selector(&rabbitmq).unwrap();
        assert!(selector.contains("app.kubernetes.io/instance=rmq-test"));
        assert!(selector.contains("app.kubernetes.io/name=rabbitmq"));

        let statefulset = build_statefulset(&rabbitmq, "rmq-test-service-account").unwrap();
        let claim_labels = statefulset.spec.unwrap().volume_claim_templates.unwrap()[0]
            .metadata
            .labels
            .clone()
            .unwrap();
        for requirement in selector.split(',') {
            let (key, value) = requirement.split_once('=').unwrap();
            assert_eq!(claim_labels.get(key).map(String::as_str), Some(value));
        }
    }
}
