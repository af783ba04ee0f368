use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec},
        apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
    },
    kube::ResourceExt,
    kvp::LabelError,
};

use crate::{
    controller::{build_object_meta, selector_labels},
    crd::RabbitmqCluster,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to build PodDisruptionBudget metadata"))]
    ObjectMeta {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build selector labels"))]
    BuildLabel { source: LabelError },
}

/// Allows one node at a time to be disrupted unless the cluster overrides it. Overrides only
/// apply from two replicas on, and `minAvailable` wins when both are given.
pub fn build_pdb(rabbitmq: &RabbitmqCluster) -> Result<PodDisruptionBudget, Error> {
    let (min_available, max_unavailable) = disruption_limits(rabbitmq);

    Ok(PodDisruptionBudget {
        metadata: build_object_meta(rabbitmq, &rabbitmq.name_any()).context(ObjectMetaSnafu)?,
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(selector_labels(rabbitmq).context(BuildLabelSnafu)?.into()),
                ..LabelSelector::default()
            }),
            min_available,
            max_unavailable,
            ..PodDisruptionBudgetSpec::default()
        }),
        status: None,
    })
}

fn disruption_limits(rabbitmq: &RabbitmqCluster) -> (Option<IntOrString>, Option<IntOrString>) {
    let default = (None, Some(IntOrString::Int(1)));
    if rabbitmq.spec.replicas < 2 {
        return default;
    }
    match &rabbitmq.spec.pod_disruption_budget {
        Some(config) => match (&config.min_available, &config.max_unavailable) {
            (Some(min_available), _) => (Some(min_available.clone()), None),
            (None, Some(max_unavailable)) => (None, Some(max_unavailable.clone())),
            (None, None) => default,
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::crd::{tests::minimal_cluster, PodDisruptionBudgetConfig};

    #[rstest]
    #[case(3, None, None, None, Some(IntOrString::Int(1)))]
    #[case(3, Some(IntOrString::Int(2)), None, Some(IntOrString::Int(2)), None)]
    #[case(3, None, Some(IntOrString::String("50%".to_string())), None, Some(IntOrString::String("50%".to_string())))]
    #[case(3, Some(IntOrString::Int(2)), Some(IntOrString::Int(2)), Some(IntOrString::Int(2)), None)]
    #[case(1, Some(IntOrString::Int(1)), None, None, Some(IntOrString::Int(1)))]
    fn test_disruption_limits(
        #[case] replicas: u16,
        #[case] min_override: Option<IntOrString>,
        #[case] max_override: Option<IntOrString>,
        #[case] min_available: Option<IntOrString>,
        #[case] max_unavailable: Option<IntOrString>,
    ) {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.replicas = replicas;
        rabbitmq.spec.pod_disruption_budget = Some(PodDisruptionBudgetConfig {
            min_available: min_override,
            max_unavailable: max_override,
        });

        let pdb = build_pdb(&rabbitmq).unwrap();
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.min_available, min_available);
        assert_eq!(spec.max_unavailable, max_unavailable);
    }

    #[test]
    fn test_pdb_selects_cluster_pods() {
        let pdb = build_pdb(&minimal_cluster()).unwrap();
        assert_eq!(pdb.metadata.name.as_deref(), Some("rmq-test"));
        let match_labels = pdb.spec.unwrap().selector.unwrap().match_labels.unwrap();
        assert_eq!(match_labels["app.kubernetes.io/instance"], "rmq-test");
        assert_eq!(match_labels["app.kubernetes.io/name"], "rabbitmq");
    }
}
