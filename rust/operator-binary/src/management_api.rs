//! A small client for the RabbitMQ management HTTP API.
//!
//! Only the endpoints needed to keep policies and users in sync are covered. All requests use
//! basic auth with the operator's service account.

use std::collections::BTreeMap;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};
use url::Url;

use crate::crd::MANAGEMENT_PORT;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to parse management API base url {url:?}"))]
    ParseBaseUrl {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("management API base url {url} has no host"))]
    BaseUrlHasNoHost { url: Url },

    #[snafu(display("failed to build request url for {path:?}"))]
    BuildRequestUrl {
        source: url::ParseError,
        path: String,
    },

    #[snafu(display("failed to execute request"))]
    HttpRequest { source: reqwest::Error },

    #[snafu(display("failed to parse json response"))]
    ParseJson { source: reqwest::Error },

    #[snafu(display("response was an HTTP error ({status}): {text}"))]
    HttpErrorResponse { status: StatusCode, text: String },

    #[snafu(display("response was an HTTP error ({status}) with undecodable text"))]
    HttpErrorResponseUndecodableText {
        status: StatusCode,
        encoding_error: reqwest::Error,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicAuthCredentials {
    pub username: String,
    pub password: String,
}

/// A policy as returned by `GET /api/policies`.
///
/// The vhost is reported as its plain name (`/`, not `%2F`).
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RemotePolicy {
    pub vhost: String,
    pub name: String,
}

/// Body of `PUT /api/policies/{vhost}/{name}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PolicyBody {
    pub pattern: String,
    pub definition: BTreeMap<String, serde_json::Value>,
    pub priority: i64,
    #[serde(rename = "apply-to")]
    pub apply_to: String,
}

/// A user as returned by `GET /api/users`. Only the name is of interest.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RemoteUser {
    pub name: String,
}

/// Body of `PUT /api/users/{name}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserBody {
    pub password: String,
    pub tags: String,
}

#[derive(Serialize)]
struct BulkDeleteUsersBody<'a> {
    users: &'a [String],
}

pub struct ManagementClient {
    http: reqwest::Client,
    base_url: Url,
    credentials: BasicAuthCredentials,
}

impl ManagementClient {
    pub fn new(
        http: reqwest::Client,
        base_url: &str,
        credentials: BasicAuthCredentials,
    ) -> Result<Self> {
        let mut base_url = Url::parse(base_url).context(ParseBaseUrlSnafu { url: base_url })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    /// Client for the management Service of a cluster, `http://<service>.<namespace>.svc:15672`.
    pub fn for_service(
        http: reqwest::Client,
        service_name: &str,
        namespace: &str,
        credentials: BasicAuthCredentials,
    ) -> Result<Self> {
        Self::new(
            http,
            &format!("http://{service_name}.{namespace}.svc:{MANAGEMENT_PORT}"),
            credentials,
        )
    }

    /// The `host:port` the management API listens on, used for the reachability check.
    pub fn endpoint(&self) -> Result<String> {
        let host = self
            .base_url
            .host_str()
            .context(BaseUrlHasNoHostSnafu {
                url: self.base_url.clone(),
            })?;
        let port = self
            .base_url
            .port_or_known_default()
            .unwrap_or(MANAGEMENT_PORT);
        Ok(format!("{host}:{port}"))
    }

    pub async fn list_policies(&self) -> Result<Vec<RemotePolicy>> {
        send_json_request(self.request(reqwest::Method::GET, "api/policies")?).await
    }

    pub async fn put_policy(&self, vhost: &str, name: &str, body: &PolicyBody) -> Result<()> {
        let path = format!(
            "api/policies/{}/{}",
            urlencoding::encode(vhost),
            urlencoding::encode(name)
        );
        send_request(self.request(reqwest::Method::PUT, &path)?.json(body)).await
    }

    pub async fn delete_policy(&self, vhost: &str, name: &str) -> Result<()> {
        let path = format!(
            "api/policies/{}/{}",
            urlencoding::encode(vhost),
            urlencoding::encode(name)
        );
        send_request(self.request(reqwest::Method::DELETE, &path)?).await
    }

    pub async fn list_users(&self) -> Result<Vec<RemoteUser>> {
        send_json_request(self.request(reqwest::Method::GET, "api/users")?).await
    }

    pub async fn put_user(&self, name: &str, body: &UserBody) -> Result<()> {
        let path = format!("api/users/{}", urlencoding::encode(name));
        send_request(self.request(reqwest::Method::PUT, &path)?.json(body)).await
    }

    pub async fn delete_user(&self, name: &str) -> Result<()> {
        let path = format!("api/users/{}", urlencoding::encode(name));
        send_request(self.request(reqwest::Method::DELETE, &path)?).await
    }

    pub async fn bulk_delete_users(&self, names: &[String]) -> Result<()> {
        let body = BulkDeleteUsersBody { users: names };
        send_request(
            self.request(reqwest::Method::POST, "api/users/bulk-delete")?
                .json(&body),
        )
        .await
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .context(BuildRequestUrlSnafu { path })?;
        Ok(self.http.request(method, url).basic_auth(
            &self.credentials.username,
            Some(&self.credentials.password),
        ))
    }
}

async fn send_json_request<T: DeserializeOwned>(req: RequestBuilder) -> Result<T> {
    let response = req.send().await.context(HttpRequestSnafu)?;
    let non_error_response = get_non_error_response(response).await?;
    non_error_response.json().await.context(ParseJsonSnafu)
}

async fn send_request(req: RequestBuilder) -> Result<()> {
    let response = req.send().await.context(HttpRequestSnafu)?;
    get_non_error_response(response).await?;
    Ok(())
}

/// Turns error statuses into [`Error::HttpErrorResponse`], keeping the body since the plain
/// reqwest error drops it.
async fn get_non_error_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() || status.is_informational() || status.is_redirection() {
        Ok(response)
    } else {
        match response.text().await {
            Ok(text) => HttpErrorResponseSnafu { status, text }.fail(),
            Err(encoding_error) => HttpErrorResponseUndecodableTextSnafu {
                status,
                encoding_error,
            }
            .fail(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use wiremock::{
        matchers::{basic_auth, body_json, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    fn client(server: &MockServer) -> ManagementClient {
        ManagementClient::new(
            reqwest::Client::new(),
            &server.uri(),
            BasicAuthCredentials {
                username: "sa".to_string(),
                password: "secret".to_string(),
            },
        )
        .unwrap()
    }

    #[rstest]
    #[case("/", "ha", "/api/policies/%2F/ha")]
    #[case("team a/b", "ha", "/api/policies/team%20a%2Fb/ha")]
    #[case("a%41", "p", "/api/policies/a%2541/p")]
    #[case("dts", "ha-all_1.x", "/api/policies/dts/ha-all_1.x")]
    #[tokio::test]
    async fn test_policy_path_segments_are_percent_encoded(
        #[case] vhost: &str,
        #[case] name: &str,
        #[case] expected_path: &str,
    ) {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(expected_path))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let body = PolicyBody {
            pattern: ".*".to_string(),
            definition: BTreeMap::from([("ha-mode".to_string(), serde_json::json!("all"))]),
            priority: 0,
            apply_to: "all".to_string(),
        };
        client(&server).put_policy(vhost, name, &body).await.unwrap();
    }

    #[test]
    fn test_endpoint_of_cluster_service() {
        let client = ManagementClient::for_service(
            reqwest::Client::new(),
            "rmq-test-api",
            "default",
            BasicAuthCredentials {
                username: "sa".to_string(),
                password: "secret".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            client.endpoint().unwrap(),
            "rmq-test-api.default.svc:15672"
        );
    }

    #[tokio::test]
    async fn test_list_policies_uses_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/policies"))
            .and(basic_auth("sa", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "vhost": "/",
                    "name": "ha",
                    "pattern": ".*",
                    "apply-to": "all",
                    "definition": {"ha-mode": "all"},
                    "priority": 0
                }
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let policies = client(&server).list_policies().await.unwrap();
        assert_eq!(
            policies,
            vec![RemotePolicy {
                vhost: "/".to_string(),
                name: "ha".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_put_user_sends_password_and_tags() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/users/alice"))
            .and(body_json(serde_json::json!({
                "password": "pw1",
                "tags": "administrator"
            })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .put_user(
                "alice",
                &UserBody {
                    password: "pw1".to_string(),
                    tags: "administrator".to_string(),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_response_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users"))
            .respond_with(ResponseTemplate::new(401).set_body_string("not_authorised"))
            .mount(&server)
            .await;

        let err = client(&server).list_users().await.unwrap_err();
        match err {
            Error::HttpErrorResponse { status, text } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(text, "not_authorised");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/users"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = client(&server).list_users().await.unwrap_err();
        assert!(matches!(err, Error::ParseJson { .. }), "{err}");
    }
}
