//! Deployment Mutation Webhook
//!
//! Adds a read-only secret volume to Deployments that asked for one. The
//! handler always answers a decodable request with an AdmissionReview, even
//! on failure: a transport error from a webhook can block unrelated writes.

use axum::body::Bytes;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use json_patch::{AddOperation, PatchOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{SecretVolumeSource, Volume, VolumeMount};
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use tracing::{debug, error, info, warn};

use crate::annotations;

/// Reserved name of the injected volume; its presence marks a Deployment as done
pub const CERT_VOLUME: &str = "tls-certificates";
/// Where the certificate lands in the first container
pub const CERT_MOUNT_PATH: &str = "/certs";

fn is_json(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|media| media.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

/// Handle a mutating admission review for Deployments
///
/// 1. Empty body -> 400
/// 2. Non-JSON content type -> 415
/// 3. Undecodable review -> 200 with `allowed: false`
/// 4. Otherwise the review response from [`mutate_deployment`]
pub async fn mutate_handler(headers: HeaderMap, body: Bytes) -> Response {
    if body.is_empty() {
        warn!("admission request with empty body");
        return (StatusCode::BAD_REQUEST, "empty body").into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !is_json(content_type) {
        warn!(content_type, "admission request with wrong content type");
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("invalid Content-Type={content_type}, expect `application/json`"),
        )
            .into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(e) => {
            error!(error = %e, "failed to decode admission review");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review()).into_response();
        }
    };
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return Json(AdmissionResponse::invalid(e.to_string()).into_review()).into_response();
        }
    };

    Json(mutate_deployment(&request).into_review()).into_response()
}

/// Decide and build the mutation for one admission request
pub fn mutate_deployment(request: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
    let uid = request.uid.clone();
    let response = AdmissionResponse::from(request);

    let Some(obj) = &request.object else {
        warn!(uid = %uid, "no object in admission request");
        return response.deny("no object in admission request");
    };

    let deployment: Deployment = match serde_json::to_value(obj).and_then(serde_json::from_value) {
        Ok(d) => d,
        Err(e) => {
            warn!(uid = %uid, error = %e, "object is not a deployment");
            return response.deny(format!("object is not a Deployment: {e}"));
        }
    };
    let name = deployment.metadata.name.clone().unwrap_or_default();

    if already_injected(&deployment) {
        debug!(uid = %uid, deployment = %name, "certificate volume already present");
        return response;
    }
    if !annotations::is_enabled(&deployment.metadata, annotations::MOUNT) {
        debug!(uid = %uid, deployment = %name, "injection not requested");
        return response;
    }

    let Some(secret_name) = annotations::get(&deployment.metadata, annotations::CERT_NAME)
        .filter(|s| !s.is_empty())
    else {
        warn!(uid = %uid, deployment = %name, "injection requested without a secret name");
        return response.deny("secret with certs not provided");
    };

    let ops = match build_patch_operations(&deployment, secret_name) {
        Ok(ops) => ops,
        Err(e) => {
            warn!(uid = %uid, deployment = %name, error = %e, "cannot build certificate patch");
            return response.deny(e);
        }
    };

    info!(uid = %uid, deployment = %name, secret = %secret_name, "injecting certificate volume");
    match response.with_patch(json_patch::Patch(ops)) {
        Ok(response) => response,
        Err(e) => {
            error!(uid = %uid, error = %e, "failed to serialize patch");
            AdmissionResponse::from(request).deny(format!("patch serialization error: {e}"))
        }
    }
}

fn already_injected(deployment: &Deployment) -> bool {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.name == CERT_VOLUME))
}

/// Patch adding the certificate volume and its mount in the first container
fn build_patch_operations(
    deployment: &Deployment,
    secret_name: &str,
) -> Result<Vec<PatchOperation>, String> {
    let pod_spec = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .ok_or("deployment has no pod template spec")?;

    let mut containers = pod_spec.containers.clone();
    let first = containers
        .first_mut()
        .ok_or("deployment has no containers to mount certificates into")?;
    first
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .push(VolumeMount {
            name: CERT_VOLUME.to_string(),
            mount_path: CERT_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });

    let mut volumes = pod_spec.volumes.clone().unwrap_or_default();
    volumes.push(Volume {
        name: CERT_VOLUME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    });

    Ok(vec![
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "template", "spec", "containers"]),
            value: serde_json::to_value(&containers).map_err(|e| e.to_string())?,
        }),
        PatchOperation::Add(AddOperation {
            path: PointerBuf::from_tokens(["spec", "template", "spec", "volumes"]),
            value: serde_json::to_value(&volumes).map_err(|e| e.to_string())?,
        }),
    ])
}
