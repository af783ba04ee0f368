//! Keeps the management users of a running cluster equal to the credentials Secret.
//!
//! The service account the operator authenticates with is never touched.

use std::collections::BTreeMap;

use snafu::{ResultExt, Snafu};

use crate::management_api::{self, ManagementClient, UserBody};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to list users"))]
    ListUsers { source: management_api::Error },

    #[snafu(display("failed to delete user {name:?}"))]
    DeleteUser {
        source: management_api::Error,
        name: String,
    },

    #[snafu(display("failed to delete users {names:?}"))]
    BulkDeleteUsers {
        source: management_api::Error,
        names: Vec<String>,
    },

    #[snafu(display("failed to apply user {name:?}"))]
    ApplyUser {
        source: management_api::Error,
        name: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UserSyncReport {
    pub deleted: Vec<String>,
    pub applied: Vec<String>,
}

/// Removes remote users missing from `declared` and writes every declared user with `tags`.
///
/// `declared` maps usernames to plaintext passwords.
pub async fn sync_users(
    client: &ManagementClient,
    service_account: &str,
    declared: &BTreeMap<String, String>,
    tags: &str,
) -> Result<UserSyncReport> {
    let mut stale: Vec<String> = client
        .list_users()
        .await
        .context(ListUsersSnafu)?
        .into_iter()
        .map(|user| user.name)
        .filter(|name| name != service_account && !declared.contains_key(name))
        .collect();
    stale.sort();
    stale.dedup();

    let mut report = UserSyncReport::default();

    match stale.as_slice() {
        [] => {}
        [name] => {
            tracing::info!(user.name = %name, "deleting user");
            client
                .delete_user(name)
                .await
                .context(DeleteUserSnafu { name })?;
        }
        names => {
            tracing::info!(user.names = ?names, "deleting users");
            client
                .bulk_delete_users(names)
                .await
                .context(BulkDeleteUsersSnafu { names })?;
        }
    }
    report.deleted = stale;

    for (name, password) in declared {
        if name == service_account {
            tracing::debug!(
                user.name = %name,
                "skipping service account listed in the credentials Secret"
            );
            continue;
        }
        tracing::debug!(user.name = %name, "applying user");
        let body = UserBody {
            password: password.clone(),
            tags: tags.to_string(),
        };
        client
            .put_user(name, &body)
            .await
            .context(ApplyUserSnafu { name })?;
        report.applied.push(name.clone());
    }

    Ok(report)
}
