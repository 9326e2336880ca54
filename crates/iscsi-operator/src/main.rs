//! iSCSI gateway operator - converges IscsiGateway resources into running gateways

mod controller_runner;

use std::path::PathBuf;

use clap::{Args, Parser};
use kube::{Api, Client, CustomResourceExt};
use tracing::info;

use iscsi_common::crd::IscsiGateway;
use iscsi_common::kube_utils::create_client;
use iscsi_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use iscsi_common::{OperatorConfig, FIELD_MANAGER};

/// iscsi-operator - deploys Ceph iSCSI gateways from IscsiGateway resources
#[derive(Parser, Debug)]
#[command(name = "iscsi-operator", version, about, long_about = None)]
struct Cli {
    /// Print the IscsiGateway CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Operator configuration file (YAML)
    #[arg(long, env = "ISCSI_OP_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig to use instead of in-cluster or default discovery
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, env = "ISCSI_OP_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

/// Per-setting overrides layered on top of the config file
#[derive(Args, Debug, Default)]
struct ConfigOverrides {
    /// Gateway container image
    #[arg(long, env = "ISCSI_OP_CONTAINER_IMAGE")]
    container_image: Option<String>,

    /// Name of the main gateway container
    #[arg(long, env = "ISCSI_OP_CONTAINER_NAME")]
    container_name: Option<String>,

    /// Image pull policy for gateway containers
    #[arg(long, env = "ISCSI_OP_IMAGE_PULL_POLICY")]
    image_pull_policy: Option<String>,

    /// rbd-target-api port probed for liveness and readiness
    #[arg(long, env = "ISCSI_OP_API_PORT")]
    api_port: Option<u16>,

    /// Default initiator name written to the gateway globals
    #[arg(long, env = "ISCSI_OP_HOSTNAME")]
    hostname: Option<String>,

    /// Default CHAP user
    #[arg(long, env = "ISCSI_OP_USERNAME")]
    username: Option<String>,

    /// Default CHAP password
    #[arg(long, env = "ISCSI_OP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Size of the shared gateway state volume
    #[arg(long, env = "ISCSI_OP_STATE_PVC_SIZE")]
    state_pvc_size: Option<String>,
}

impl ConfigOverrides {
    fn apply(self, config: &mut OperatorConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(v) = value {
                *slot = v;
            }
        }
        set(&mut config.container_image, self.container_image);
        set(&mut config.container_name, self.container_name);
        set(&mut config.image_pull_policy, self.image_pull_policy);
        set(&mut config.api_port, self.api_port);
        set(&mut config.hostname, self.hostname);
        set(&mut config.username, self.username);
        set(&mut config.password, self.password);
        set(&mut config.state_pvc_size, self.state_pvc_size);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&IscsiGateway::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format,
    })?;

    let mut config = OperatorConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut config);
    config.validate()?;
    info!(
        image = %config.container_image,
        api_port = config.api_port,
        "iscsi-operator starting"
    );

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    ensure_crds_installed(&client).await?;

    controller_runner::build_gateway_controller(client, config).await;
    info!("iscsi-operator stopped");
    Ok(())
}

/// Install the IscsiGateway CRD with server-side apply
///
/// Installing on startup keeps the served schema in step with the operator
/// version. CephBlockPool belongs to Rook and is never installed here.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing IscsiGateway CRD...");
    crds.patch(
        "iscsigateways.iscsi.ruohwai",
        &params,
        &Patch::Apply(&IscsiGateway::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install IscsiGateway CRD: {}", e))?;

    Ok(())
}
