//! The credential secret of a broker.
//!
//! The secret is written on every provisioning attempt of a broker that is not ready yet. A
//! root password that was stored once is never replaced, because the remote API only reveals
//! it when the instance is first created.

use std::collections::BTreeMap;

use k8s_openapi::{ByteString, api::core::v1::Secret};
use kube::{Resource, ResourceExt, api::ObjectMeta};

use crate::crd::{CREDENTIALS_LABEL_KEY, CREDENTIALS_LABEL_VALUE, DbBroker};

pub const ROOT_PASSWORD_KEY: &str = "DB_PASSWORD";
pub const NO_ROOT_PASSWORD_KEY: &str = "DB_PASSWORD_NO_ROOT";

/// Returns the value stored under `key` if it is a non-empty UTF-8 string.
pub fn stored_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()?
        .get(key)
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
        .filter(|value| !value.is_empty())
}

/// Computes the secret data from what is already stored and what was just provisioned.
///
/// - `root_password` is the password returned by instance creation, `None` if the instance
///   already existed. A key that is already present always wins.
/// - `no_root_password` is `Some` when a new non-root user was created in this attempt and
///   must replace the stored value, `None` to keep the stored value.
pub fn merge_credentials(
    existing: Option<&Secret>,
    root_password: Option<&str>,
    no_root_password: Option<&str>,
) -> BTreeMap<String, ByteString> {
    let mut data = existing
        .and_then(|secret| secret.data.clone())
        .unwrap_or_default();

    data.entry(ROOT_PASSWORD_KEY.to_owned())
        .or_insert_with(|| ByteString(root_password.unwrap_or_default().as_bytes().to_vec()));

    match no_root_password {
        Some(password) => {
            data.insert(
                NO_ROOT_PASSWORD_KEY.to_owned(),
                ByteString(password.as_bytes().to_vec()),
            );
        }
        None => {
            data.entry(NO_ROOT_PASSWORD_KEY.to_owned())
                .or_insert_with(|| ByteString(Vec::new()));
        }
    }

    data
}

/// Builds the credential secret of `broker`, owned by it.
pub fn build_secret(broker: &DbBroker, data: BTreeMap<String, ByteString>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(broker.secret_name()),
            namespace: broker.namespace(),
            labels: Some(BTreeMap::from([(
                CREDENTIALS_LABEL_KEY.to_owned(),
                CREDENTIALS_LABEL_VALUE.to_owned(),
            )])),
            owner_references: broker.controller_owner_ref(&()).map(|owner| vec![owner]),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Secret::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DbBrokerSpec;

    fn secret_with(entries: &[(&str, &str)]) -> Secret {
        Secret {
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Secret::default()
        }
    }

    fn value(data: &BTreeMap<String, ByteString>, key: &str) -> String {
        String::from_utf8(data[key].0.clone()).expect("utf-8")
    }

    #[test]
    fn new_secret_gets_both_passwords() {
        let data = merge_credentials(None, Some("rootpass"), Some("userpass"));

        assert_eq!(value(&data, ROOT_PASSWORD_KEY), "rootpass");
        assert_eq!(value(&data, NO_ROOT_PASSWORD_KEY), "userpass");
    }

    #[test]
    fn stored_root_password_is_preserved() {
        let existing = secret_with(&[(ROOT_PASSWORD_KEY, "original"), (NO_ROOT_PASSWORD_KEY, "old")]);

        let data = merge_credentials(Some(&existing), Some("new-root"), None);

        assert_eq!(value(&data, ROOT_PASSWORD_KEY), "original");
        assert_eq!(value(&data, NO_ROOT_PASSWORD_KEY), "old");
    }

    #[test]
    fn fresh_non_root_password_replaces_stored_one() {
        let existing = secret_with(&[(ROOT_PASSWORD_KEY, "original"), (NO_ROOT_PASSWORD_KEY, "old")]);

        let data = merge_credentials(Some(&existing), None, Some("fresh"));

        assert_eq!(value(&data, ROOT_PASSWORD_KEY), "original");
        assert_eq!(value(&data, NO_ROOT_PASSWORD_KEY), "fresh");
    }

    #[test]
    fn already_existing_instance_leaves_empty_root_password() {
        let data = merge_credentials(None, None, Some("userpass"));

        assert_eq!(value(&data, ROOT_PASSWORD_KEY), "");
        assert_eq!(stored_value(&secret_with(&[(ROOT_PASSWORD_KEY, "")]), ROOT_PASSWORD_KEY), None);
    }

    #[test]
    fn merging_twice_is_stable() {
        let first = merge_credentials(None, Some("rootpass"), Some("userpass"));
        let stored = Secret {
            data: Some(first.clone()),
            ..Secret::default()
        };

        let second = merge_credentials(Some(&stored), None, None);

        assert_eq!(first, second);
    }

    #[test]
    fn secret_is_named_after_the_broker() {
        let mut broker = DbBroker::new(
            "w1-abcdef",
            DbBrokerSpec {
                workload_name: "w1".to_owned(),
                workload_namespace: "ns1".to_owned(),
                project_id: "p".to_owned(),
            },
        );
        broker.metadata.namespace = Some("ns1".to_owned());
        broker.metadata.uid = Some("broker-uid".to_owned());

        let secret = build_secret(&broker, BTreeMap::new());

        assert_eq!(secret.metadata.name.as_deref(), Some("w1-abcdef"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(
            secret.labels().get(CREDENTIALS_LABEL_KEY).map(String::as_str),
            Some(CREDENTIALS_LABEL_VALUE)
        );
        let owners = secret.metadata.owner_references.expect("owned by the broker");
        assert_eq!(owners[0].kind, "DbBroker");
        assert_eq!(owners[0].uid, "broker-uid");
        assert_eq!(owners[0].controller, Some(true));
    }
}
