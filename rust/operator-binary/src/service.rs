use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        api::core::v1::{Service, ServicePort, ServiceSpec},
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kube::{runtime::reflector::ObjectRef, ResourceExt},
    kvp::{Label, LabelError},
};

use crate::{
    controller::{build_recommended_labels, selector_labels},
    crd::{
        service_monitor::{
            NamespaceSelector, ServiceMonitor, ServiceMonitorEndpoint, ServiceMonitorSelector,
            ServiceMonitorSpec,
        },
        RabbitmqCluster, AMQP_PORT, AMQP_PORT_NAME, EPMD_PORT, EPMD_PORT_NAME, MANAGEMENT_PORT,
        MANAGEMENT_PORT_NAME, PROMETHEUS_PORT_NAME,
    },
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object {rabbitmq} is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
        rabbitmq: ObjectRef<RabbitmqCluster>,
    },

    #[snafu(display("failed to build object meta data"))]
    ObjectMeta {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to build label"))]
    BuildLabel { source: LabelError },
}

/// The headless Service giving every node a stable DNS name for peer discovery.
///
/// Not-ready addresses are published so nodes can find each other while the cluster forms.
pub fn build_discovery_service(rabbitmq: &RabbitmqCluster) -> Result<Service> {
    let service_spec = ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        cluster_ip: Some("None".to_string()),
        ports: Some(vec![
            service_port(AMQP_PORT_NAME, AMQP_PORT),
            service_port(EPMD_PORT_NAME, EPMD_PORT),
        ]),
        selector: Some(selector(rabbitmq)?),
        publish_not_ready_addresses: Some(true),
        ..ServiceSpec::default()
    };

    Ok(Service {
        metadata: metadata(rabbitmq, rabbitmq.discovery_service_name())?.build(),
        spec: Some(service_spec),
        status: None,
    })
}

/// The Service in front of the management HTTP API, used by the operator itself.
pub fn build_management_service(rabbitmq: &RabbitmqCluster) -> Result<Service> {
    let service_spec = ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        ports: Some(vec![service_port(MANAGEMENT_PORT_NAME, MANAGEMENT_PORT)]),
        selector: Some(selector(rabbitmq)?),
        ..ServiceSpec::default()
    };

    Ok(Service {
        metadata: metadata(rabbitmq, rabbitmq.management_service_name())?.build(),
        spec: Some(service_spec),
        status: None,
    })
}

pub fn build_prometheus_service(rabbitmq: &RabbitmqCluster) -> Result<Service> {
    let prometheus_label =
        Label::try_from(("prometheus.io/scrape", "true")).context(BuildLabelSnafu)?;

    let service_spec = ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        ports: Some(vec![service_port(
            PROMETHEUS_PORT_NAME,
            rabbitmq.spec.prometheus_exporter_port,
        )]),
        selector: Some(selector(rabbitmq)?),
        ..ServiceSpec::default()
    };

    Ok(Service {
        metadata: metadata(rabbitmq, rabbitmq.prometheus_service_name())?
            .with_label(prometheus_label)
            .build(),
        spec: Some(service_spec),
        status: None,
    })
}

/// Lets a Prometheus operator scrape the exporter through the Prometheus Service.
pub fn build_service_monitor(rabbitmq: &RabbitmqCluster) -> Result<ServiceMonitor> {
    let match_labels = metadata(rabbitmq, rabbitmq.prometheus_service_name())?
        .build()
        .labels
        .unwrap_or_default();

    Ok(ServiceMonitor {
        metadata: metadata(rabbitmq, rabbitmq.name_any())?.build(),
        spec: ServiceMonitorSpec {
            selector: ServiceMonitorSelector { match_labels },
            namespace_selector: rabbitmq.namespace().map(|namespace| NamespaceSelector {
                match_names: vec![namespace],
            }),
            endpoints: vec![ServiceMonitorEndpoint {
                port: PROMETHEUS_PORT_NAME.to_string(),
                path: Some("/metrics".to_string()),
                interval: Some("30s".to_string()),
            }],
        },
    })
}

fn metadata(rabbitmq: &RabbitmqCluster, name: String) -> Result<ObjectMetaBuilder> {
    let mut builder = ObjectMetaBuilder::new();
    builder
        .name_and_namespace(rabbitmq)
        .name(name)
        .ownerreference_from_resource(rabbitmq, None, Some(true))
        .context(ObjectMissingMetadataForOwnerRefSnafu {
            rabbitmq: ObjectRef::from_obj(rabbitmq),
        })?
        .with_recommended_labels(build_recommended_labels(rabbitmq))
        .context(ObjectMetaSnafu)?;
    Ok(builder)
}

fn selector(rabbitmq: &RabbitmqCluster) -> Result<BTreeMap<String, String>> {
    Ok(selector_labels(rabbitmq).context(BuildLabelSnafu)?.into())
}

fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: port.into(),
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port.into())),
        ..ServicePort::default()
    }
}
