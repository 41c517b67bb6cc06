//! Per-namespace ACME account key
//!
//! The account credentials live in the immutable `le-issuer` secret. They are
//! created on first use and never rewritten: if two reconciles race, the loser
//! sees `AlreadyExists`, re-reads the winner's key and uses that account.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::info;

use crate::acme::{AccountKey, AcmeDirectory, AcmeSession};
use crate::kube_client::KubeClient;
use crate::{Error, Result};

/// Name of the account secret in every namespace
pub const ACCOUNT_SECRET: &str = "le-issuer";
/// Key holding the serialized credentials inside [`ACCOUNT_SECRET`]
pub const ACCOUNT_KEY_FIELD: &str = "tls.key";

/// Immutable secret persisting an account key
pub fn account_secret(namespace: &str, key: &AccountKey) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(ACCOUNT_SECRET.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        immutable: Some(true),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            ACCOUNT_KEY_FIELD.to_string(),
            ByteString(key.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

async fn read_account_key(client: &dyn KubeClient, namespace: &str) -> Result<AccountKey> {
    let secret = client.get_secret(namespace, ACCOUNT_SECRET).await?;
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(ACCOUNT_KEY_FIELD))
        .map(|b| AccountKey::from_bytes(b.0.clone()))
        .ok_or_else(|| Error::not_found(format!("{ACCOUNT_SECRET}/{ACCOUNT_KEY_FIELD}")))
}

/// Open a session for the namespace's account, registering one if needed
pub async fn resolve_session(
    client: &dyn KubeClient,
    acme: &dyn AcmeDirectory,
    namespace: &str,
    email: &str,
    ca_url: &str,
) -> Result<Box<dyn AcmeSession>> {
    match read_account_key(client, namespace).await {
        Ok(key) => return acme.resolve_account_by_key(&key, ca_url).await,
        Err(e) if e.is_not_exist() => {}
        Err(e) => return Err(e),
    }

    let (session, key) = acme.register(email, ca_url).await?;
    match client.create_secret(&account_secret(namespace, &key)).await {
        Ok(_) => {
            info!(namespace, "acme account key persisted");
            Ok(session)
        }
        Err(e) if e.is_already_exists() => {
            info!(namespace, "acme account key created concurrently, using the stored one");
            let stored = read_account_key(client, namespace).await?;
            acme.resolve_account_by_key(&stored, ca_url).await
        }
        Err(e) => Err(e),
    }
}
