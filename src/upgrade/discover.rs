use std::collections::HashSet;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, EnvVar};
use kube::ResourceExt;
use tracing::info;

use crate::error::{Error, Result};

/// Image path fragments that identify a postgres container.
const POSTGRES_IMAGE_HINTS: [&str; 4] = [
    "/bitnami/postgresql:",
    "docker.io/bitnami/postgresql:",
    "/postgres:",
    "/postgresql:",
];

/// Extracts the postgres major version from a container image tag.
///
/// `docker.io/bitnami/postgresql:15.0.0-debian-10-r90` resolves to `15`.
/// Bare majors (`postgres:14`) are accepted; a missing or non-semver tag
/// is a validation error.
pub fn postgres_major_from_image(image: &str) -> Result<String> {
    let tag = match image.rsplit_once(':') {
        // a colon inside a path segment is a registry port, not a tag
        Some((_, tag)) if !tag.contains('/') => tag,
        _ => {
            return Err(Error::Validation(
                "failed to auto discover postgres version: image is missing a tag".into(),
            ))
        }
    };

    let version = semver::Version::parse(&pad_to_full_semver(tag)).map_err(|_| {
        Error::Validation(format!("image tag {tag:?} is not a valid semver version"))
    })?;
    Ok(version.major.to_string())
}

/// Pads a tag like `14` or `9.6` out to a full `major.minor.patch` so the
/// semver parser accepts it, leaving any prerelease/build suffix intact.
fn pad_to_full_semver(tag: &str) -> String {
    let tag = tag.strip_prefix('v').unwrap_or(tag);
    let split = tag
        .find(|c| c == '-' || c == '+')
        .unwrap_or(tag.len());
    let (core, suffix) = tag.split_at(split);

    let dots = core.chars().filter(|&c| c == '.').count();
    let mut padded = core.to_string();
    for _ in dots..2 {
        padded.push_str(".0");
    }
    padded + suffix
}

/// Finds the postgres container in a StatefulSet, by name when one is
/// given, otherwise by matching the image against the known patterns.
pub fn find_postgres_container(sts: &StatefulSet, name: Option<&str>) -> Result<Container> {
    let containers = sts
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();
    if containers.is_empty() {
        return Err(Error::NotFound(format!(
            "postgres container: statefulset {} has no containers",
            sts.name_any()
        )));
    }

    let container = match name {
        Some(name) => containers.iter().find(|container| container.name == name),
        None => containers.iter().find(|container| {
            container.image.as_deref().map_or(false, |image| {
                POSTGRES_IMAGE_HINTS.iter().any(|hint| image.contains(hint))
            })
        }),
    };

    match container {
        Some(container) => {
            info!("found container {:?}", container.name);
            Ok(container.clone())
        }
        None => Err(Error::NotFound("postgres container".into())),
    }
}

/// The value of the first of `names` present as a plain-value environment
/// variable.
pub fn env_value<'a>(env: &'a [EnvVar], names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        env.iter()
            .find(|var| var.name == *name)
            .and_then(|var| var.value.as_deref())
    })
}

/// Resolves the claim of the container's data volume as
/// `<template>-<statefulset>-0`, where `<template>` is the first volume
/// mount backed by one of the StatefulSet's volumeClaimTemplates.
pub fn data_claim_name(sts: &StatefulSet, container: &Container) -> Result<String> {
    let templates: HashSet<&str> = sts
        .spec
        .as_ref()
        .and_then(|spec| spec.volume_claim_templates.as_ref())
        .map(|templates| {
            templates
                .iter()
                .filter_map(|template| template.metadata.name.as_deref())
                .collect()
        })
        .unwrap_or_default();

    let mounts = container.volume_mounts.as_deref().unwrap_or_default();
    if mounts.is_empty() {
        return Err(Error::Validation(format!(
            "container {:?} has no volume mounts",
            container.name
        )));
    }

    let mount = mounts
        .iter()
        .find(|mount| templates.contains(mount.name.as_str()))
        .ok_or_else(|| {
            Error::Validation(format!(
                "could not determine the data volume of container {:?}: no volume mount is backed by a volume claim template",
                container.name
            ))
        })?;

    Ok(format!("{}-{}-0", mount.name, sts.name_any()))
}
