use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        api::{
            apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy},
            core::v1::{
                ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
                EnvVarSource, ObjectFieldSelector, PersistentVolumeClaim,
                PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
                SecretKeySelector, SecretVolumeSource, TCPSocketAction, Volume, VolumeMount,
                VolumeResourceRequirements,
            },
        },
        apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
    },
    kube::ResourceExt,
    kvp::LabelError,
};

use crate::{
    config_map::{INIT_SCRIPT, SSL_DIR},
    controller::{build_object_meta, build_recommended_labels, selector_labels},
    crd::{
        RabbitmqCluster, RabbitmqImage, AMQPS_PORT, AMQP_PORT, AMQP_PORT_NAME,
        DISTRIBUTION_PORT, DISTRIBUTION_PORT_NAME, EPMD_PORT, EPMD_PORT_NAME, MANAGEMENT_PORT,
        MANAGEMENT_PORT_NAME, PROMETHEUS_PORT_NAME,
    },
    secret::{PASSWORD_KEY, USERNAME_KEY},
};

pub const DATA_VOLUME_NAME: &str = "rabbit-data";
const CONFIG_VOLUME_NAME: &str = "rabbit-config";
const ETC_VOLUME_NAME: &str = "rabbit-etc";
const SSL_VOLUME_NAME: &str = "rabbit-ssl";

const CONFIG_MOUNT_PATH: &str = "/rabbit-config";
const ETC_MOUNT_PATH: &str = "/etc/rabbitmq";
const DATA_MOUNT_PATH: &str = "/var/lib/rabbitmq";

const RABBITMQ_CONTAINER_NAME: &str = "rabbitmq";
const INIT_CONTAINER_NAME: &str = "init-config";
const EXPORTER_CONTAINER_NAME: &str = "prometheus-exporter";

const DEFAULT_EXPORTER_IMAGE: &str = "kbudde/rabbitmq-exporter";
const DEFAULT_EXPORTER_TAG: &str = "v1.0.0";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to build StatefulSet metadata"))]
    ObjectMeta {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build selector labels"))]
    BuildLabel { source: LabelError },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The StatefulSet running one RabbitMQ node per replica, each with its own data volume.
///
/// `service_account_secret` is read by the exporter sidecar to authenticate against the
/// management API.
pub fn build_statefulset(
    rabbitmq: &RabbitmqCluster,
    service_account_secret: &str,
) -> Result<StatefulSet> {
    let spec = &rabbitmq.spec;
    let selector: BTreeMap<String, String> =
        selector_labels(rabbitmq).context(BuildLabelSnafu)?.into();

    let pod_metadata = ObjectMetaBuilder::new()
        .with_recommended_labels(build_recommended_labels(rabbitmq))
        .context(ObjectMetaSnafu)?
        .build();

    let mut containers = vec![rabbitmq_container(rabbitmq)];
    if rabbitmq.prometheus_exporter_enabled() {
        containers.push(exporter_container(rabbitmq, service_account_secret));
    }

    let mut volumes = vec![
        Volume {
            name: CONFIG_VOLUME_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: rabbitmq.name_any(),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: ETC_VOLUME_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Volume::default()
        },
    ];
    if let Some(secret_name) = ssl_secret(rabbitmq) {
        volumes.push(Volume {
            name: SSL_VOLUME_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret_name.to_string()),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
    }

    let pod_spec = PodSpec {
        init_containers: Some(vec![init_container(rabbitmq)]),
        containers,
        volumes: Some(volumes),
        affinity: spec.affinity.clone(),
        tolerations: non_empty(spec.tolerations.clone()),
        node_selector: non_empty_map(spec.node_selector.clone()),
        ..PodSpec::default()
    };

    let data_claim = PersistentVolumeClaim {
        metadata: ObjectMetaBuilder::new()
            .name(DATA_VOLUME_NAME)
            .with_labels(selector_labels(rabbitmq).context(BuildLabelSnafu)?)
            .build(),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    spec.volume_size.clone(),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            storage_class_name: spec.storage_class_name.clone(),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    };

    Ok(StatefulSet {
        metadata: build_object_meta(rabbitmq, &rabbitmq.name_any()).context(ObjectMetaSnafu)?,
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas.into()),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..LabelSelector::default()
            },
            service_name: Some(rabbitmq.discovery_service_name()),
            template: PodTemplateSpec {
                metadata: Some(pod_metadata),
                spec: Some(pod_spec),
            },
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..StatefulSetUpdateStrategy::default()
            }),
            volume_claim_templates: Some(vec![data_claim]),
            ..StatefulSetSpec::default()
        }),
        status: None,
    })
}

fn init_container(rabbitmq: &RabbitmqCluster) -> Container {
    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(rabbitmq.spec.image.reference()),
        command: Some(vec![
            "sh".to_string(),
            format!("{CONFIG_MOUNT_PATH}/{INIT_SCRIPT}"),
        ]),
        volume_mounts: Some(vec![
            volume_mount(CONFIG_VOLUME_NAME, CONFIG_MOUNT_PATH),
            volume_mount(ETC_VOLUME_NAME, ETC_MOUNT_PATH),
            volume_mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH),
        ]),
        ..Container::default()
    }
}

fn rabbitmq_container(rabbitmq: &RabbitmqCluster) -> Container {
    let spec = &rabbitmq.spec;
    let discovery_domain = format!(
        "{}.$(MY_POD_NAMESPACE).svc.cluster.local",
        rabbitmq.discovery_service_name()
    );

    let mut env = vec![
        field_ref_env("MY_POD_NAME", "metadata.name"),
        field_ref_env("MY_POD_NAMESPACE", "metadata.namespace"),
        plain_env("RABBITMQ_USE_LONGNAME", "true"),
        plain_env("K8S_SERVICE_NAME", &rabbitmq.discovery_service_name()),
        plain_env("K8S_HOSTNAME_SUFFIX", &format!(".{discovery_domain}")),
        plain_env(
            "RABBITMQ_NODENAME",
            &format!("rabbit@$(MY_POD_NAME).{discovery_domain}"),
        ),
    ];
    env.extend(spec.env.iter().cloned());

    let mut ports = vec![
        container_port(AMQP_PORT_NAME, AMQP_PORT),
        container_port(EPMD_PORT_NAME, EPMD_PORT),
        container_port(MANAGEMENT_PORT_NAME, MANAGEMENT_PORT),
        container_port(DISTRIBUTION_PORT_NAME, DISTRIBUTION_PORT),
    ];
    if spec.ssl.enabled {
        ports.push(container_port("amqps", AMQPS_PORT));
    }

    let mut volume_mounts = vec![
        volume_mount(ETC_VOLUME_NAME, ETC_MOUNT_PATH),
        volume_mount(DATA_VOLUME_NAME, DATA_MOUNT_PATH),
    ];
    if ssl_secret(rabbitmq).is_some() {
        volume_mounts.push(VolumeMount {
            read_only: Some(true),
            ..volume_mount(SSL_VOLUME_NAME, SSL_DIR)
        });
    }

    Container {
        name: RABBITMQ_CONTAINER_NAME.to_string(),
        image: Some(spec.image.reference()),
        env: Some(env),
        ports: Some(ports),
        resources: Some(ResourceRequirements {
            requests: non_empty_map(spec.pod_requests.clone()),
            limits: non_empty_map(spec.pod_limits.clone()),
            ..ResourceRequirements::default()
        }),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(AMQP_PORT.into()),
                ..TCPSocketAction::default()
            }),
            initial_delay_seconds: Some(10),
            period_seconds: Some(10),
            ..Probe::default()
        }),
        volume_mounts: Some(volume_mounts),
        ..Container::default()
    }
}

/// Sidecar exporting RabbitMQ metrics, reading the service account from its Secret.
fn exporter_container(rabbitmq: &RabbitmqCluster, service_account_secret: &str) -> Container {
    let spec = &rabbitmq.spec;
    let image = spec
        .prometheus_exporter_image
        .clone()
        .unwrap_or_else(|| RabbitmqImage {
            name: DEFAULT_EXPORTER_IMAGE.to_string(),
            tag: DEFAULT_EXPORTER_TAG.to_string(),
        });

    Container {
        name: EXPORTER_CONTAINER_NAME.to_string(),
        image: Some(image.reference()),
        env: Some(vec![
            plain_env("RABBIT_URL", &format!("http://localhost:{MANAGEMENT_PORT}")),
            secret_key_env("RABBIT_USER", service_account_secret, USERNAME_KEY),
            secret_key_env("RABBIT_PASSWORD", service_account_secret, PASSWORD_KEY),
            plain_env("PUBLISH_PORT", &spec.prometheus_exporter_port.to_string()),
        ]),
        ports: Some(vec![container_port(
            PROMETHEUS_PORT_NAME,
            spec.prometheus_exporter_port,
        )]),
        ..Container::default()
    }
}

fn ssl_secret(rabbitmq: &RabbitmqCluster) -> Option<&str> {
    let ssl = &rabbitmq.spec.ssl;
    ssl.existing_secret
        .as_deref()
        .filter(|secret| ssl.enabled && !secret.is_empty())
}

fn container_port(name: &str, port: u16) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port.into(),
        protocol: Some("TCP".to_string()),
        ..ContainerPort::default()
    }
}

fn volume_mount(name: &str, mount_path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: mount_path.to_string(),
        ..VolumeMount::default()
    }
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..EnvVar::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..ObjectFieldSelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn secret_key_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..SecretKeySelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn non_empty_map<V>(map: BTreeMap<String, V>) -> Option<BTreeMap<String, V>> {
    (!map.is_empty()).then_some(map)
}

#[cfg(test)]
mod tests {
    use stackable_operator::k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::crd::tests::minimal_cluster;

    fn containers(statefulset: &StatefulSet) -> Vec<Container> {
        statefulset
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers
            .clone()
    }

    #[test]
    fn test_statefulset_shape() {
        let mut rabbitmq = minimal_cluster();
        rabbitmq
            .spec
            .pod_limits
            .insert("memory".to_string(), Quantity("2Gi".to_string()));
        let statefulset = build_statefulset(&rabbitmq, "rmq-test-service-account").unwrap();
        let spec = statefulset.spec.as_ref().unwrap();

        assert_eq!(statefulset.metadata.name.as_deref(), Some("rmq-test"));
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name.as_deref(), Some("rmq-test-discovery"));
        assert_eq!(
            spec.update_strategy.as_ref().unwrap().type_.as_deref(),
            Some("RollingUpdate")
        );

        let claim = &spec.volume_claim_templates.as_ref().unwrap()[0];
        assert_eq!(claim.metadata.name.as_deref(), Some(DATA_VOLUME_NAME));
        assert_eq!(
            claim.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.as_ref().unwrap()
                ["storage"],
            Quantity("1Gi".to_string())
        );

        let template_labels = spec.template.metadata.as_ref().unwrap().labels.as_ref().unwrap();
        for (key, value) in spec.selector.match_labels.as_ref().unwrap() {
            assert_eq!(template_labels.get(key), Some(value), "label {key}");
        }

        let containers = containers(&statefulset);
        assert_eq!(containers.len(), 1);
        let rabbit = &containers[0];
        assert_eq!(rabbit.image.as_deref(), Some("rabbitmq:3.13-management"));
        let ports: Vec<i32> = rabbit
            .ports
            .iter()
            .flatten()
            .map(|p| p.container_port)
            .collect();
        assert_eq!(ports, vec![5672, 4369, 15672, 25672]);
        assert_eq!(
            rabbit.resources.as_ref().unwrap().limits.as_ref().unwrap()["memory"],
            Quantity("2Gi".to_string())
        );
        assert!(rabbit.resources.as_ref().unwrap().requests.is_none());
    }

    #[test]
    fn test_user_env_follows_discovery_env() {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.env = vec![plain_env("RABBITMQ_LOGS", "-")];
        let statefulset = build_statefulset(&rabbitmq, "rmq-test-service-account").unwrap();

        let env = containers(&statefulset)[0].env.clone().unwrap();
        assert_eq!(env.last().unwrap().name, "RABBITMQ_LOGS");
        assert!(env.iter().any(|e| e.name == "RABBITMQ_NODENAME"
            && e.value.as_deref()
                == Some("rabbit@$(MY_POD_NAME).rmq-test-discovery.$(MY_POD_NAMESPACE).svc.cluster.local")));
    }

    #[test]
    fn test_exporter_sidecar_reads_service_account() {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.prometheus_exporter_port = 9419;
        let statefulset = build_statefulset(&rabbitmq, "shared-sa").unwrap();

        let containers = containers(&statefulset);
        assert_eq!(containers.len(), 2);
        let exporter = &containers[1];
        assert_eq!(
            exporter.image.as_deref(),
            Some("kbudde/rabbitmq-exporter:v1.0.0")
        );
        let password = exporter
            .env
            .iter()
            .flatten()
            .find(|e| e.name == "RABBIT_PASSWORD")
            .and_then(|e| e.value_from.as_ref())
            .and_then(|v| v.secret_key_ref.as_ref())
            .unwrap();
        assert_eq!(password.name, "shared-sa");
        assert_eq!(password.key, "password");
    }

    #[test]
    fn test_ssl_secret_is_mounted() {
        let mut rabbitmq = minimal_cluster();
        rabbitmq.spec.ssl.enabled = true;
        rabbitmq.spec.ssl.existing_secret = Some("rmq-tls".to_string());
        let statefulset = build_statefulset(&rabbitmq, "rmq-test-service-account").unwrap();

        let pod = statefulset.spec.unwrap().template.spec.unwrap();
        let ssl_volume = pod
            .volumes
            .unwrap()
            .into_iter()
            .find(|v| v.name == SSL_VOLUME_NAME)
            .unwrap();
        assert_eq!(
            ssl_volume.secret.unwrap().secret_name.as_deref(),
            Some("rmq-tls")
        );
        assert!(pod.containers[0]
            .volume_mounts
            .iter()
            .flatten()
            .any(|m| m.mount_path == SSL_DIR));
        assert!(pod.containers[0]
            .ports
            .iter()
            .flatten()
            .any(|p| p.container_port == 5671));
    }
}
