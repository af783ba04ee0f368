//! Resolves the Secrets a cluster depends on, provisioning the default ones on first use.
//!
//! Values are stored raw in `Secret.data`, the API's own base64 encoding of the `data` field is
//! the only encoding applied.

use std::{collections::BTreeMap, string::FromUtf8Error};

use rand::{distr::Alphanumeric, Rng};
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube,
};

use crate::{
    controller::build_object_meta,
    converge::ObjectStore,
    crd::RabbitmqCluster,
};

pub const SERVICE_ACCOUNT_USERNAME: &str = "sa";
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";
pub const COOKIE_KEY: &str = "cookie";

const GENERATED_SECRET_LENGTH: usize = 30;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to get Secret {name}"))]
    GetSecret { source: kube::Error, name: String },

    #[snafu(display("failed to create Secret {name}"))]
    CreateSecret { source: kube::Error, name: String },

    #[snafu(display("failed to build metadata for Secret {name}"))]
    BuildSecretMetadata {
        source: stackable_operator::builder::meta::Error,
        name: String,
    },

    #[snafu(display("Secret {name} is referenced by the cluster but does not exist"))]
    LinkedSecretMissing { name: String },

    #[snafu(display("Secret {name} has no key {key:?}"))]
    MissingSecretKey { name: String, key: String },

    #[snafu(display("value of key {key:?} in Secret {name} is not valid UTF-8"))]
    NonUtf8SecretValue {
        source: FromUtf8Error,
        name: String,
        key: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The operator's own administrative RabbitMQ account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAccountCredentials {
    pub username: String,
    pub password: String,
    /// Shared Erlang cookie of the cluster nodes.
    pub cookie: String,
}

/// Returns the service account Secret name and its credentials.
///
/// A missing default-named Secret is generated exactly once. A missing Secret that was named
/// explicitly in the cluster is an error, since it is owned by someone else.
pub async fn resolve_or_create_service_account<S>(
    secrets: &S,
    rabbitmq: &RabbitmqCluster,
) -> Result<(String, ServiceAccountCredentials)>
where
    S: ObjectStore<Secret> + ?Sized,
{
    let name = rabbitmq.service_account_secret_name();
    let secret = match secrets
        .get_observed(&name)
        .await
        .context(GetSecretSnafu { name: &name })?
    {
        Some(secret) => secret,
        None if rabbitmq.service_account_secret_is_linked() => {
            return LinkedSecretMissingSnafu { name }.fail()
        }
        None => {
            tracing::info!(secret.name = %name, "generating service account credentials");
            let data = BTreeMap::from([
                (USERNAME_KEY.to_string(), SERVICE_ACCOUNT_USERNAME.to_string()),
                (
                    PASSWORD_KEY.to_string(),
                    random_string(GENERATED_SECRET_LENGTH),
                ),
                (COOKIE_KEY.to_string(), random_string(GENERATED_SECRET_LENGTH)),
            ]);
            create_secret(secrets, rabbitmq, &name, data).await?
        }
    };

    let credentials = ServiceAccountCredentials {
        username: read_key(&secret, &name, USERNAME_KEY)?,
        password: read_key(&secret, &name, PASSWORD_KEY)?,
        cookie: read_key(&secret, &name, COOKIE_KEY)?,
    };
    Ok((name, credentials))
}

/// Returns the Secret listing the management users of the cluster, creating an empty one when
/// the default-named Secret does not exist yet.
pub async fn resolve_or_create_credentials_secret<S>(
    secrets: &S,
    rabbitmq: &RabbitmqCluster,
) -> Result<Secret>
where
    S: ObjectStore<Secret> + ?Sized,
{
    let name = rabbitmq.credentials_secret_name();
    match secrets
        .get_observed(&name)
        .await
        .context(GetSecretSnafu { name: &name })?
    {
        Some(secret) => Ok(secret),
        None if rabbitmq.credentials_secret_is_linked() => LinkedSecretMissingSnafu { name }.fail(),
        None => {
            tracing::info!(secret.name = %name, "creating empty credentials Secret");
            create_secret(secrets, rabbitmq, &name, BTreeMap::new()).await
        }
    }
}

/// Maps every key of the credentials Secret (a username) to its value (the password).
pub fn read_user_credentials(secret: &Secret) -> Result<BTreeMap<String, String>> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    secret
        .data
        .iter()
        .flatten()
        .map(|(username, ByteString(password))| {
            let password = String::from_utf8(password.clone()).context(NonUtf8SecretValueSnafu {
                name: &name,
                key: username,
            })?;
            Ok((username.clone(), password))
        })
        .collect()
}

pub fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

async fn create_secret<S>(
    secrets: &S,
    rabbitmq: &RabbitmqCluster,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<Secret>
where
    S: ObjectStore<Secret> + ?Sized,
{
    let secret = Secret {
        metadata: build_object_meta(rabbitmq, name)
            .context(BuildSecretMetadataSnafu { name })?,
        data: Some(
            data.into_iter()
                .map(|(key, value)| (key, ByteString(value.into_bytes())))
                .collect(),
        ),
        type_: Some("Opaque".to_string()),
        ..Secret::default()
    };
    secrets
        .create_object(&secret)
        .await
        .context(CreateSecretSnafu { name })
}

fn read_key(secret: &Secret, name: &str, key: &str) -> Result<String> {
    let ByteString(value) = secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .context(MissingSecretKeySnafu { name, key })?;
    String::from_utf8(value.clone()).context(NonUtf8SecretValueSnafu { name, key })
}
