//! Constants shared between the library and the command-line binary.

/// Package identity, used for the per-container state file and type marker.
pub mod package {
    pub const NAME: &str = "stevedore";

    /// Name of the per-container state file.
    pub const STATE_FILE: &str = "stevedore.json";

    /// Value of the `type` field in records owned by this system.
    pub const STATE_TYPE: &str = "stevedore 0.0.1";

    /// Value written as `engine` into `/run/.containerenv`.
    pub const ENGINE: &str = "stevedore-0.1.0";
}

/// Image media types.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
    pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
    pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
        "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
}

/// Image annotation keys.
pub mod annotations {
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
    pub const BASE_IMAGE_NAME: &str = "org.opencontainers.image.base.name";
    pub const BASE_IMAGE_DIGEST: &str = "org.opencontainers.image.base.digest";
}

/// Defaults injected into every run.
pub mod run {
    pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

    /// Nameserver provided by slirp4netns in rootless mode.
    pub const SLIRP_DNS: &str = "10.0.2.3";

    /// Hostname that resolves to the host from inside the container.
    pub const HOST_CONTAINERS_INTERNAL: &str = "host.containers.internal";

    /// Default in-container directory for secrets.
    pub const SECRETS_DIR: &str = "/run/secrets";

    /// Default in-container directory for forwarded ssh-agent sockets.
    pub const SSH_DIR: &str = "/run/buildkit/ssh_agent";

    /// Length of the container ID prefix used as a default hostname.
    pub const HOSTNAME_ID_LEN: usize = 12;
}

/// Environment variables read by stevedore.
pub mod env {
    pub const CONFIG: &str = "STEVEDORE_CONFIG";
    pub const ROOT: &str = "STEVEDORE_ROOT";
    pub const RUNROOT: &str = "STEVEDORE_RUNROOT";
    pub const ISOLATION: &str = "STEVEDORE_ISOLATION";
    pub const RUNTIME: &str = "STEVEDORE_RUNTIME";
    pub const DEBUG_STAGES: &str = "STEVEDORE_DEBUG_STAGES";
    pub const LOG_DIR: &str = "STEVEDORE_LOG_DIR";
}

/// Default pull retry policy.
pub mod retry {
    pub const MAX_PULL_ATTEMPTS: u32 = 3;
    pub const PULL_BACKOFF_BASE_MS: u64 = 1000;
}
