//! Workload mutation: backup container and volumes

use k8s_openapi::api::core::v1::{
    Container, DownwardAPIVolumeFile, DownwardAPIVolumeSource, EmptyDirVolumeSource, EnvVar,
    EnvVarSource, ObjectFieldSelector, PodSpec, Volume, VolumeMount,
};
use kube::ResourceExt;

use crate::config::{ImageRef, OperatorConfig};
use crate::crd::{BackupType, Restic};
use crate::workload::WorkloadRef;

use super::{
    ensure_container_deleted, ensure_volume_deleted, merge_local_object_references,
    upsert_container, upsert_volume, ANALYTICS_CLIENT_ID_ENV, LOCAL_VOLUME_NAME, NODE_NAME_ENV,
    PODINFO_MOUNT_PATH, PODINFO_VOLUME_NAME, POD_NAME_ENV, SCRATCH_DIR_MOUNT_PATH,
    SCRATCH_DIR_VOLUME_NAME, STASH_CONTAINER, VERSION_TAG,
};

/// Continuous backup container run next to the workload containers
pub fn new_sidecar_container(
    restic: &Restic,
    workload: &WorkloadRef,
    config: &OperatorConfig,
) -> Container {
    let image = backup_image(restic, config);
    let args = vec![
        "backup".to_string(),
        format!("--restic-name={}", restic.name_any()),
        format!("--workload-kind={}", workload.kind),
        format!("--workload-name={}", workload.name),
        format!("--docker-registry={}", image.registry),
        format!("--image-tag={}", image.tag),
        "--run-via-cron=true".to_string(),
        format!("--pushgateway-url={}", config.pushgateway_url()),
        format!("--enable-analytics={}", config.enable_analytics),
    ];

    let mut volume_mounts = vec![
        VolumeMount {
            name: SCRATCH_DIR_VOLUME_NAME.to_string(),
            mount_path: SCRATCH_DIR_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: PODINFO_VOLUME_NAME.to_string(),
            mount_path: PODINFO_MOUNT_PATH.to_string(),
            ..Default::default()
        },
    ];
    volume_mounts.extend(restic.spec.volume_mounts.iter().map(|mount| VolumeMount {
        name: mount.name.clone(),
        mount_path: mount.mount_path.clone(),
        sub_path: mount.sub_path.clone(),
        read_only: Some(true),
        ..Default::default()
    }));
    if let Some(local) = &restic.spec.backend.local {
        let (_, mount) = local.to_volume_and_mount(LOCAL_VOLUME_NAME);
        volume_mounts.push(mount);
    }

    Container {
        name: STASH_CONTAINER.to_string(),
        image: Some(image.to_container_image()),
        args: Some(args),
        env: Some(vec![
            field_ref_env(NODE_NAME_ENV, "spec.nodeName"),
            field_ref_env(POD_NAME_ENV, "metadata.name"),
            analytics_env(config),
        ]),
        resources: restic.spec.resources.clone(),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    }
}

/// One-shot backup container run before the workload containers start
pub fn new_init_container(
    restic: &Restic,
    workload: &WorkloadRef,
    config: &OperatorConfig,
) -> Container {
    let mut container = new_sidecar_container(restic, workload, config);
    let image = backup_image(restic, config);

    let mut args = vec![
        "backup".to_string(),
        format!("--restic-name={}", restic.name_any()),
        format!("--workload-kind={}", workload.kind),
        format!("--workload-name={}", workload.name),
        format!("--docker-registry={}", image.registry),
        format!("--image-tag={}", image.tag),
        format!("--pushgateway-url={}", config.pushgateway_url()),
        format!("--enable-analytics={}", config.enable_analytics),
    ];
    if config.enable_rbac {
        args.push("--enable-rbac=true".to_string());
    }
    container.args = Some(args);
    container
}

/// Operator image, with the tag overridden by the Restic's version annotation
fn backup_image(restic: &Restic, config: &OperatorConfig) -> ImageRef {
    let mut image = config.image();
    if let Some(tag) = restic.annotations().get(VERSION_TAG) {
        image.tag = tag.clone();
    }
    image
}

pub(crate) fn analytics_env(config: &OperatorConfig) -> EnvVar {
    EnvVar {
        name: ANALYTICS_CLIENT_ID_ENV.to_string(),
        value: Some(config.analytics_client_id.clone()),
        ..Default::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn scratch_volume() -> Volume {
    Volume {
        name: SCRATCH_DIR_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Downward API volume exposing the pod labels to the backup container
pub fn podinfo_volume() -> Volume {
    Volume {
        name: PODINFO_VOLUME_NAME.to_string(),
        downward_api: Some(DownwardAPIVolumeSource {
            items: Some(vec![DownwardAPIVolumeFile {
                path: "labels".to_string(),
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.labels".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Reconcile the local-backend volume after a policy change.
///
/// A local volume previously applied by `old` is replaced at its position
/// when `new` still has a local backend and removed otherwise. Other volumes
/// are never reordered.
pub fn merge_local_volume(volumes: &mut Vec<Volume>, old: Option<&Restic>, new: &Restic) {
    let old_pos = old
        .filter(|r| r.spec.backend.local.is_some())
        .and_then(|_| volumes.iter().position(|v| v.name == LOCAL_VOLUME_NAME));

    match (&new.spec.backend.local, old_pos) {
        (Some(local), Some(pos)) => {
            let (volume, _) = local.to_volume_and_mount(LOCAL_VOLUME_NAME);
            volumes[pos] = volume;
        }
        (Some(local), None) => {
            let (volume, _) = local.to_volume_and_mount(LOCAL_VOLUME_NAME);
            upsert_volume(volumes, volume);
        }
        (None, Some(pos)) => {
            volumes.remove(pos);
        }
        (None, None) => {}
    }
}

/// Inject the backup container and its volumes for `restic` into a pod spec.
///
/// `old` is the Restic applied previously, if any; it decides whether a
/// local-backend volume found in the spec belongs to this operator.
pub fn apply_backup(
    pod: &mut PodSpec,
    restic: &Restic,
    old: Option<&Restic>,
    workload: &WorkloadRef,
    config: &OperatorConfig,
) {
    match restic.spec.backup_type {
        BackupType::Online => {
            let sidecar = new_sidecar_container(restic, workload, config);
            upsert_container(&mut pod.containers, sidecar);
            if let Some(init) = pod.init_containers.as_mut() {
                ensure_container_deleted(init, STASH_CONTAINER);
            }
        }
        BackupType::Offline => {
            let init = new_init_container(restic, workload, config);
            upsert_container(pod.init_containers.get_or_insert_with(Vec::new), init);
            ensure_container_deleted(&mut pod.containers, STASH_CONTAINER);
        }
    }

    let volumes = pod.volumes.get_or_insert_with(Vec::new);
    upsert_volume(volumes, scratch_volume());
    upsert_volume(volumes, podinfo_volume());
    merge_local_volume(volumes, old, restic);

    if !restic.spec.image_pull_secrets.is_empty() {
        merge_local_object_references(
            pod.image_pull_secrets.get_or_insert_with(Vec::new),
            &restic.spec.image_pull_secrets,
        );
    }
}

/// Remove everything `apply_backup` injected for the previously applied Restic
pub fn remove_backup(pod: &mut PodSpec, old: Option<&Restic>) {
    ensure_container_deleted(&mut pod.containers, STASH_CONTAINER);
    if let Some(init) = pod.init_containers.as_mut() {
        ensure_container_deleted(init, STASH_CONTAINER);
    }
    if let Some(volumes) = pod.volumes.as_mut() {
        ensure_volume_deleted(volumes, SCRATCH_DIR_VOLUME_NAME);
        ensure_volume_deleted(volumes, PODINFO_VOLUME_NAME);
        if old.is_some_and(|r| r.spec.backend.local.is_some()) {
            ensure_volume_deleted(volumes, LOCAL_VOLUME_NAME);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Backend, FileGroup, LocalSpec, ResticSpec};
    use crate::workload::WorkloadKind;
    use k8s_openapi::api::core::v1::HostPathVolumeSource;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn restic(name: &str, local: Option<LocalSpec>) -> Restic {
        Restic {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: ResticSpec {
                file_groups: vec![FileGroup {
                    path: "/source/data".to_string(),
                    ..Default::default()
                }],
                backend: Backend {
                    storage_secret_name: "stash-demo".to_string(),
                    local,
                    ..Default::default()
                },
                schedule: "@every 1m".to_string(),
                volume_mounts: vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: "/source/data".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        }
    }

    fn host_path(path: &str) -> LocalSpec {
        LocalSpec {
            host_path: Some(HostPathVolumeSource {
                path: path.to_string(),
                ..Default::default()
            }),
            mount_path: "/safe/data".to_string(),
            ..Default::default()
        }
    }

    fn pod_with_data_volume() -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "busybox".to_string(),
                image: Some("busybox".to_string()),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn volume_names(pod: &PodSpec) -> Vec<String> {
        pod.volumes
            .iter()
            .flatten()
            .map(|v| v.name.clone())
            .collect()
    }

    fn web() -> WorkloadRef {
        WorkloadRef::new(WorkloadKind::Deployment, "web")
    }

    #[test]
    fn nightly_policy_on_web_deployment() {
        let config = OperatorConfig::default();
        let nightly = restic("nightly", None);
        let mut pod = pod_with_data_volume();

        apply_backup(&mut pod, &nightly, None, &web(), &config);

        let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["busybox", STASH_CONTAINER]);
        let args = pod.containers[1].args.clone().unwrap();
        assert!(args.contains(&"--workload-kind=Deployment".to_string()));
        assert!(args.contains(&"--workload-name=web".to_string()));
        assert!(args.contains(&"--restic-name=nightly".to_string()));
        assert_eq!(
            volume_names(&pod),
            vec!["data", SCRATCH_DIR_VOLUME_NAME, PODINFO_VOLUME_NAME]
        );
    }

    #[test]
    fn sidecar_arguments_are_exact() {
        let config = OperatorConfig {
            docker_registry: "appscode".to_string(),
            image_tag: "0.7.0".to_string(),
            operator_namespace: "kube-system".to_string(),
            enable_analytics: false,
            ..Default::default()
        };
        let container = new_sidecar_container(&restic("nightly", None), &web(), &config);
        assert_eq!(
            container.args.unwrap(),
            vec![
                "backup",
                "--restic-name=nightly",
                "--workload-kind=Deployment",
                "--workload-name=web",
                "--docker-registry=appscode",
                "--image-tag=0.7.0",
                "--run-via-cron=true",
                "--pushgateway-url=http://stash-operator.kube-system.svc:56789",
                "--enable-analytics=false",
            ]
        );
        assert_eq!(container.image.as_deref(), Some("appscode/stash:0.7.0"));
    }

    #[test]
    fn init_container_runs_once_and_carries_rbac_flag() {
        let config = OperatorConfig {
            enable_rbac: true,
            ..Default::default()
        };
        let container = new_init_container(&restic("nightly", None), &web(), &config);
        let args = container.args.unwrap();
        assert!(!args.contains(&"--run-via-cron=true".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--enable-rbac=true"));
    }

    #[test]
    fn version_tag_annotation_overrides_image() {
        let mut nightly = restic("nightly", None);
        nightly
            .annotations_mut()
            .insert(VERSION_TAG.to_string(), "canary".to_string());
        let container = new_sidecar_container(&nightly, &web(), &OperatorConfig::default());
        assert_eq!(container.image.as_deref(), Some("appscode/stash:canary"));
        assert!(container.args.unwrap().contains(&"--image-tag=canary".to_string()));
    }

    #[test]
    fn policy_mounts_are_read_only() {
        let container =
            new_sidecar_container(&restic("nightly", None), &web(), &OperatorConfig::default());
        let mounts = container.volume_mounts.unwrap();
        let data = mounts.iter().find(|m| m.name == "data").unwrap();
        assert_eq!(data.read_only, Some(true));
        assert!(mounts.iter().any(|m| m.name == SCRATCH_DIR_VOLUME_NAME));
        assert!(mounts.iter().any(|m| m.name == PODINFO_VOLUME_NAME));
    }

    #[test]
    fn apply_backup_is_idempotent() {
        let config = OperatorConfig::default();
        let policy = restic("nightly", Some(host_path("/repo")));

        let mut once = pod_with_data_volume();
        apply_backup(&mut once, &policy, None, &web(), &config);

        let mut twice = once.clone();
        apply_backup(&mut twice, &policy, Some(&policy), &web(), &config);

        assert_eq!(once, twice);
        assert_eq!(
            volume_names(&once),
            vec!["data", SCRATCH_DIR_VOLUME_NAME, PODINFO_VOLUME_NAME, LOCAL_VOLUME_NAME]
        );
    }

    #[test]
    fn local_backend_mount_is_added_to_sidecar() {
        let container = new_sidecar_container(
            &restic("nightly", Some(host_path("/repo"))),
            &web(),
            &OperatorConfig::default(),
        );
        let mounts = container.volume_mounts.unwrap();
        let local = mounts.iter().find(|m| m.name == LOCAL_VOLUME_NAME).unwrap();
        assert_eq!(local.mount_path, "/safe/data");
    }

    #[test]
    fn removing_local_backend_removes_only_its_volume() {
        let old = restic("nightly", Some(host_path("/repo")));
        let mut volumes = vec![
            Volume {
                name: "a".to_string(),
                ..Default::default()
            },
            Volume {
                name: LOCAL_VOLUME_NAME.to_string(),
                ..Default::default()
            },
            Volume {
                name: "b".to_string(),
                ..Default::default()
            },
        ];

        merge_local_volume(&mut volumes, Some(&old), &restic("nightly", None));

        let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn changed_local_backend_replaces_volume_at_same_position() {
        let old = restic("nightly", Some(host_path("/old")));
        let new = restic("nightly", Some(host_path("/new")));
        let mut volumes = vec![
            Volume {
                name: LOCAL_VOLUME_NAME.to_string(),
                ..Default::default()
            },
            Volume {
                name: "data".to_string(),
                ..Default::default()
            },
        ];

        merge_local_volume(&mut volumes, Some(&old), &new);

        assert_eq!(volumes[0].name, LOCAL_VOLUME_NAME);
        assert_eq!(volumes[0].host_path.as_ref().unwrap().path, "/new");
        assert_eq!(volumes[1].name, "data");
    }

    #[test]
    fn unowned_local_volume_is_left_alone_without_previous_local_backend() {
        let mut volumes = vec![Volume {
            name: LOCAL_VOLUME_NAME.to_string(),
            ..Default::default()
        }];
        merge_local_volume(&mut volumes, None, &restic("nightly", None));
        assert_eq!(volumes.len(), 1);
    }

    #[test]
    fn switching_to_offline_moves_container_to_init() {
        let config = OperatorConfig::default();
        let online = restic("nightly", None);
        let mut offline = online.clone();
        offline.spec.backup_type = BackupType::Offline;

        let mut pod = pod_with_data_volume();
        apply_backup(&mut pod, &online, None, &web(), &config);
        apply_backup(&mut pod, &offline, Some(&online), &web(), &config);

        assert!(pod.containers.iter().all(|c| c.name != STASH_CONTAINER));
        let init = pod.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, STASH_CONTAINER);
    }

    #[test]
    fn remove_backup_restores_original_spec() {
        let config = OperatorConfig::default();
        let policy = restic("nightly", Some(host_path("/repo")));
        let original = pod_with_data_volume();

        let mut pod = original.clone();
        apply_backup(&mut pod, &policy, None, &web(), &config);
        remove_backup(&mut pod, Some(&policy));

        assert_eq!(pod, original);
    }
}
