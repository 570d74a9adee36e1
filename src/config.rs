//! Operator configuration
//!
//! Parsed once from command-line flags (with environment fallbacks) and then
//! shared read-only as `Arc<OperatorConfig>` by every component.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Args;

/// Name of the operator image inside the registry
pub const IMAGE_STASH: &str = "stash";

/// Port the pushgateway sidecar of the operator listens on
pub const PUSHGATEWAY_PORT: u16 = 56789;

/// Flags of the `run` command
#[derive(Args, Debug, Clone)]
pub struct OperatorConfig {
    /// Provision service accounts and roles for launched jobs and sidecars
    #[arg(long, env = "STASH_ENABLE_RBAC", default_value_t = false)]
    pub enable_rbac: bool,

    /// Docker registry the stash image is pulled from
    #[arg(long, env = "STASH_DOCKER_REGISTRY", default_value = "appscode")]
    pub docker_registry: String,

    /// Tag of the stash image used for sidecars and jobs
    #[arg(long, env = "STASH_IMAGE_TAG", default_value = "0.7.0")]
    pub image_tag: String,

    /// Number of times a failing key is retried before it is dropped
    #[arg(long, default_value_t = 5)]
    pub max_num_requeues: u32,

    /// Number of workers per resource kind
    #[arg(long = "workers", default_value_t = 2)]
    pub num_threads: usize,

    /// Address of the metrics and health endpoint
    #[arg(long, default_value = "0.0.0.0:56790")]
    pub ops_address: SocketAddr,

    /// Send anonymous usage statistics
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub enable_analytics: bool,

    /// Analytics client identifier injected into generated containers
    #[arg(long, env = "APPSCODE_ANALYTICS_CLIENT_ID", default_value = "")]
    pub analytics_client_id: String,

    /// Namespace the operator runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "kube-system")]
    pub operator_namespace: String,

    /// First retry delay of a failing key, in milliseconds
    #[arg(long, default_value_t = 5)]
    pub retry_base_delay_ms: u64,

    /// Upper bound of the retry delay, in seconds
    #[arg(long, default_value_t = 1000)]
    pub retry_max_delay_secs: u64,

    /// Requeue every cached object this often, in seconds; 0 disables it
    #[arg(long, default_value_t = 600)]
    pub resync_period_secs: u64,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enable_rbac: false,
            docker_registry: "appscode".to_string(),
            image_tag: "0.7.0".to_string(),
            max_num_requeues: 5,
            num_threads: 2,
            ops_address: SocketAddr::from(([0, 0, 0, 0], 56790)),
            enable_analytics: true,
            analytics_client_id: String::new(),
            operator_namespace: "kube-system".to_string(),
            retry_base_delay_ms: 5,
            retry_max_delay_secs: 1000,
            resync_period_secs: 600,
        }
    }
}

impl OperatorConfig {
    /// Image used for sidecars, init containers and jobs
    pub fn image(&self) -> ImageRef {
        ImageRef {
            registry: self.docker_registry.clone(),
            image: IMAGE_STASH.to_string(),
            tag: self.image_tag.clone(),
        }
    }

    /// URL of the pushgateway served next to the operator
    pub fn pushgateway_url(&self) -> String {
        format!(
            "http://stash-operator.{}.svc:{}",
            self.operator_namespace, PUSHGATEWAY_PORT
        )
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_secs(self.retry_max_delay_secs)
    }

    /// `None` when periodic resync is off
    pub fn resync_period(&self) -> Option<Duration> {
        (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs))
    }
}

/// Container image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub image: String,
    pub tag: String,
}

impl ImageRef {
    /// `<registry>/<image>:<tag>`
    pub fn to_container_image(&self) -> String {
        format!("{}/{}:{}", self.registry, self.image, self.tag)
    }
}
