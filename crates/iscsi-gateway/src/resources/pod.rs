//! Pod specs for the gateway StatefulSet and the tcmu-runner DaemonSet

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, Probe, SecurityContext,
    TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use iscsi_common::Result;

use super::volumes::{
    ceph_volume, config_volume, dev_volume, lib_modules_volume, state_volume, VolumeKeeper,
};
use crate::planner::InstanceConfiguration;

/// Services started by the main gateway container, in order
const GATEWAY_SERVICES: &[&str] = &["tcmu-runner", "rbd-target-gw", "rbd-target-api"];

/// Normalise a configured pull policy, defaulting to `IfNotPresent`
pub fn image_pull_policy(configured: &str) -> String {
    match configured {
        "Always" | "Never" | "IfNotPresent" => configured.to_string(),
        _ => "IfNotPresent".to_string(),
    }
}

fn default_pod_env(instance: &InstanceConfiguration<'_>) -> Vec<EnvVar> {
    vec![
        EnvVar {
            name: "ISCSI_CONTAINER_ID".to_string(),
            value: Some(instance.instance_name()),
            ..Default::default()
        },
        EnvVar {
            name: "ISCSI_CONFIG".to_string(),
            value: Some(instance.container_config_path()),
            ..Default::default()
        },
        // set-node expands $(HOSTNAME); Kubernetes only expands declared vars
        EnvVar {
            name: "HOSTNAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Container skeleton shared by every gateway container
fn gateway_container(
    instance: &InstanceConfiguration<'_>,
    name: &str,
    env: &[EnvVar],
    vols: &VolumeKeeper,
) -> Container {
    Container {
        name: name.to_string(),
        image: Some(instance.config.container_image.clone()),
        image_pull_policy: Some(image_pull_policy(&instance.config.image_pull_policy)),
        env: Some(env.to_vec()),
        volume_mounts: Some(vols.mounts()),
        ..Default::default()
    }
}

fn tcp_probe(port: u16) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            host: None,
            port: IntOrString::Int(i32::from(port)),
        }),
        ..Default::default()
    }
}

fn privileged() -> SecurityContext {
    SecurityContext {
        privileged: Some(true),
        ..Default::default()
    }
}

/// Pod spec for the clustered gateway StatefulSet
pub fn build_clustered_pod_spec(instance: &InstanceConfiguration<'_>) -> Result<PodSpec> {
    let mut vols = VolumeKeeper::new();
    vols.add(ceph_volume(instance))
        .add(config_volume(instance))
        .add(state_volume())
        .add(dev_volume())
        .add(lib_modules_volume());
    vols.validate()?;

    let env = default_pod_env(instance);

    let init = Container {
        args: Some(instance.initializer_args("init")),
        ..gateway_container(instance, "init", &env, &vols)
    };
    let set_node = Container {
        args: Some(instance.set_node_args()),
        ..gateway_container(instance, "iscsi-set-node", &env, &vols)
    };

    let start_services = GATEWAY_SERVICES
        .iter()
        .map(|svc| format!("systemctl start {svc}"))
        .collect::<Vec<_>>()
        .join(" && ");
    let gateway = Container {
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![start_services]),
        liveness_probe: Some(tcp_probe(instance.config.api_port)),
        readiness_probe: Some(tcp_probe(instance.config.api_port)),
        security_context: Some(privileged()),
        ..gateway_container(instance, &instance.config.container_name, &env, &vols)
    };
    let watch = Container {
        args: Some(instance.update_config_watch_args()),
        ..gateway_container(instance, "watch-update-config", &env, &vols)
    };

    Ok(PodSpec {
        volumes: Some(vols.volumes()),
        init_containers: Some(vec![init, set_node]),
        containers: vec![gateway, watch],
        ..Default::default()
    })
}

/// Pod spec for the per-node tcmu-runner daemon
pub fn build_tcmu_runner_pod_spec(instance: &InstanceConfiguration<'_>) -> Result<PodSpec> {
    let mut vols = VolumeKeeper::new();
    vols.add(ceph_volume(instance))
        .add(dev_volume())
        .add(lib_modules_volume());
    vols.validate()?;

    let runner = Container {
        name: super::TCMU_RUNNER_NAME.to_string(),
        image: Some(instance.config.container_image.clone()),
        image_pull_policy: Some(image_pull_policy(&instance.config.image_pull_policy)),
        command: Some(vec!["tcmu-runner".to_string()]),
        volume_mounts: Some(vols.mounts()),
        security_context: Some(privileged()),
        ..Default::default()
    };

    Ok(PodSpec {
        host_network: Some(true),
        volumes: Some(vols.volumes()),
        containers: vec![runner],
        ..Default::default()
    })
}
