//! Recovery and check jobs
//!
//! Job names are derived from the triggering object's name, so a second
//! create for the same object collides with the first instead of producing
//! a duplicate.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::config::OperatorConfig;
use crate::crd::{LocalSpec, Recovery, Restic};

use super::sidecar::{analytics_env, scratch_volume};
use super::{
    APP_LABEL_STASH, CHECK_JOB_PREFIX, LABEL_APP, LABEL_OPERATION, LABEL_RECOVERY, LABEL_RESTIC,
    LOCAL_VOLUME_NAME, OPERATION_CHECK, OPERATION_RECOVERY, RECOVERY_JOB_PREFIX,
    SCRATCH_DIR_MOUNT_PATH, SCRATCH_DIR_VOLUME_NAME, STASH_CONTAINER,
};

pub fn recovery_job_name(recovery_name: &str) -> String {
    format!("{}{}", RECOVERY_JOB_PREFIX, recovery_name)
}

pub fn check_job_name(restic_name: &str) -> String {
    format!("{}{}", CHECK_JOB_PREFIX, restic_name)
}

/// Job restoring the paths of a Recovery
pub fn new_recovery_job(recovery: &Recovery, config: &OperatorConfig) -> Job {
    let name = recovery.name_any();

    let (mut volumes, mut volume_mounts): (Vec<Volume>, Vec<VolumeMount>) = recovery
        .spec
        .recovered_volumes
        .iter()
        .enumerate()
        .map(|(i, local)| local.to_volume_and_mount(&format!("vol-{}", i)))
        .unzip();

    let args = vec![
        "recover".to_string(),
        format!("--recovery-name={}", name),
        format!("--enable-analytics={}", config.enable_analytics),
    ];

    let mut job = build_job(
        recovery_job_name(&name),
        recovery.namespace(),
        recovery.controller_owner_ref(&()),
        BTreeMap::from([
            (LABEL_APP.to_string(), APP_LABEL_STASH.to_string()),
            (LABEL_RECOVERY.to_string(), name.clone()),
            (LABEL_OPERATION.to_string(), OPERATION_RECOVERY.to_string()),
        ]),
        args,
        config,
    );

    let pod = pod_spec_mut(&mut job);
    pod.node_name = recovery.spec.node_name.clone();
    if !recovery.spec.image_pull_secrets.is_empty() {
        pod.image_pull_secrets = Some(recovery.spec.image_pull_secrets.clone());
    }

    // recovered volumes come first, scratch and local backend after them
    prepend(&mut pod.volumes, &mut volumes);
    prepend(&mut pod.containers[0].volume_mounts, &mut volume_mounts);
    attach_local_backend(pod, recovery.spec.backend.local.as_ref());

    job
}

/// Job verifying the integrity of a Restic repository
pub fn new_check_job(
    restic: &Restic,
    host_name: &str,
    smart_prefix: &str,
    config: &OperatorConfig,
) -> Job {
    let name = restic.name_any();
    let args = vec![
        "check".to_string(),
        format!("--restic-name={}", name),
        format!("--host-name={}", host_name),
        format!("--smart-prefix={}", smart_prefix),
        format!("--enable-analytics={}", config.enable_analytics),
    ];

    let mut job = build_job(
        check_job_name(&name),
        restic.namespace(),
        restic.controller_owner_ref(&()),
        BTreeMap::from([
            (LABEL_APP.to_string(), APP_LABEL_STASH.to_string()),
            (LABEL_RESTIC.to_string(), name.clone()),
            (LABEL_OPERATION.to_string(), OPERATION_CHECK.to_string()),
        ]),
        args,
        config,
    );

    let pod = pod_spec_mut(&mut job);
    if !restic.spec.image_pull_secrets.is_empty() {
        pod.image_pull_secrets = Some(restic.spec.image_pull_secrets.clone());
    }
    // the local volume is derived from the backend, users never declare it
    attach_local_backend(pod, restic.spec.backend.local.as_ref());

    job
}

fn build_job(
    name: String,
    namespace: Option<String>,
    owner: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference>,
    labels: BTreeMap<String, String>,
    args: Vec<String>,
    config: &OperatorConfig,
) -> Job {
    let service_account_name = config.enable_rbac.then(|| name.clone());
    Job {
        metadata: ObjectMeta {
            name: Some(name),
            namespace,
            owner_references: owner.map(|o| vec![o]),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: STASH_CONTAINER.to_string(),
                        image: Some(config.image().to_container_image()),
                        args: Some(args),
                        env: Some(vec![analytics_env(config)]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: SCRATCH_DIR_VOLUME_NAME.to_string(),
                            mount_path: SCRATCH_DIR_MOUNT_PATH.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    restart_policy: Some("OnFailure".to_string()),
                    service_account_name,
                    volumes: Some(vec![scratch_volume()]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

fn pod_spec_mut(job: &mut Job) -> &mut PodSpec {
    job.spec
        .get_or_insert_with(JobSpec::default)
        .template
        .spec
        .get_or_insert_with(PodSpec::default)
}

fn prepend<T>(target: &mut Option<Vec<T>>, items: &mut Vec<T>) {
    let list = target.get_or_insert_with(Vec::new);
    items.append(list);
    std::mem::swap(list, items);
}

fn attach_local_backend(pod: &mut PodSpec, local: Option<&LocalSpec>) {
    let Some(local) = local else {
        return;
    };
    let (volume, mount) = local.to_volume_and_mount(LOCAL_VOLUME_NAME);
    pod.volumes.get_or_insert_with(Vec::new).push(volume);
    if let Some(container) = pod.containers.first_mut() {
        container.volume_mounts.get_or_insert_with(Vec::new).push(mount);
    }
}
