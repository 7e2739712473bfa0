//! Image configuration edits.
//!
//! Every setter updates the OCI and the Docker config together so either
//! format can be committed. Docker-only settings (healthcheck, hostname,
//! shell, ...) are dropped from the OCI config on commit anyway.

use stevedore_shared::errors::StevedoreResult;

use super::Builder;
use crate::image::config::{ContainerConfig, Empty, HealthConfig, ImageConfig, normalize_port};

impl Builder {
    fn edit(&mut self, apply: impl Fn(&mut ImageConfig)) {
        let state = self.state_mut();
        apply(&mut state.oci_config);
        apply(&mut state.docker_config);
    }

    fn edit_container(&mut self, apply: impl Fn(&mut ContainerConfig)) {
        self.edit(|config| apply(&mut config.config));
    }

    /// The OCI form of the pending config.
    pub fn oci_config(&self) -> &ImageConfig {
        &self.state().oci_config
    }

    pub fn docker_config(&self) -> &ImageConfig {
        &self.state().docker_config
    }

    pub fn set_cmd(&mut self, cmd: Vec<String>) {
        self.edit_container(|c| c.cmd = Some(cmd.clone()));
    }

    pub fn set_entrypoint(&mut self, entrypoint: Vec<String>) {
        self.edit_container(|c| c.entrypoint = Some(entrypoint.clone()));
    }

    pub fn set_env(&mut self, key: &str, value: &str) {
        self.edit_container(|c| c.set_env(key, value));
    }

    pub fn unset_env(&mut self, key: &str) {
        self.edit_container(|c| c.unset_env(key));
    }

    pub fn clear_env(&mut self) {
        self.edit_container(|c| c.env.clear());
    }

    pub fn env(&self) -> &[String] {
        &self.state().oci_config.config.env
    }

    pub fn set_workdir(&mut self, workdir: &str) {
        self.edit_container(|c| c.working_dir = workdir.to_string());
    }

    pub fn workdir(&self) -> &str {
        &self.state().oci_config.config.working_dir
    }

    pub fn set_user(&mut self, user: &str) {
        self.edit_container(|c| c.user = user.to_string());
    }

    pub fn user(&self) -> &str {
        &self.state().oci_config.config.user
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.edit_container(|c| {
            c.labels.insert(key.to_string(), value.to_string());
        });
    }

    pub fn unset_label(&mut self, key: &str) {
        self.edit_container(|c| {
            c.labels.remove(key);
        });
    }

    /// Expose a port; `8080` means `8080/tcp`.
    pub fn set_port(&mut self, port: &str) -> StevedoreResult<()> {
        let port = normalize_port(port)?;
        self.edit_container(|c| {
            c.exposed_ports.insert(port.clone(), Empty {});
        });
        Ok(())
    }

    pub fn unset_port(&mut self, port: &str) -> StevedoreResult<()> {
        let port = normalize_port(port)?;
        self.edit_container(|c| {
            c.exposed_ports.remove(&port);
        });
        Ok(())
    }

    pub fn clear_ports(&mut self) {
        self.edit_container(|c| c.exposed_ports.clear());
    }

    pub fn add_volume(&mut self, path: &str) {
        self.edit_container(|c| {
            c.volumes.insert(path.to_string(), Empty {});
        });
    }

    pub fn remove_volume(&mut self, path: &str) {
        self.edit_container(|c| {
            c.volumes.remove(path);
        });
    }

    pub fn clear_volumes(&mut self) {
        self.edit_container(|c| c.volumes.clear());
    }

    /// Volumes declared by the image, sorted.
    pub fn volumes(&self) -> Vec<String> {
        self.state().oci_config.config.volumes.keys().cloned().collect()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.state_mut()
            .image_annotations
            .insert(key.to_string(), value.to_string());
    }

    pub fn unset_annotation(&mut self, key: &str) {
        self.state_mut().image_annotations.remove(key);
    }

    pub fn set_hostname(&mut self, hostname: &str) {
        self.edit_container(|c| c.hostname = hostname.to_string());
    }

    pub fn hostname(&self) -> &str {
        &self.state().docker_config.config.hostname
    }

    pub fn set_domainname(&mut self, domainname: &str) {
        self.edit_container(|c| c.domainname = domainname.to_string());
    }

    pub fn set_shell(&mut self, shell: Vec<String>) {
        self.edit_container(|c| c.shell = shell.clone());
    }

    pub fn shell(&self) -> &[String] {
        &self.state().docker_config.config.shell
    }

    pub fn set_stop_signal(&mut self, signal: &str) {
        self.edit_container(|c| c.stop_signal = signal.to_string());
    }

    pub fn set_onbuild(&mut self, triggers: Vec<String>) {
        self.edit_container(|c| c.on_build = triggers.clone());
    }

    /// Record the image author. Docker calls it the maintainer.
    pub fn set_maintainer(&mut self, author: &str) {
        self.edit(|c| c.author = author.to_string());
    }

    pub fn set_os(&mut self, os: &str) {
        self.edit(|c| c.os = os.to_string());
    }

    pub fn set_architecture(&mut self, architecture: &str) {
        self.edit(|c| c.architecture = architecture.to_string());
    }

    pub fn set_variant(&mut self, variant: &str) {
        self.edit(|c| c.variant = variant.to_string());
    }

    pub fn set_os_version(&mut self, os_version: &str) {
        self.edit(|c| c.os_version = os_version.to_string());
    }

    /// Docker-format only; OCI configs have no healthcheck.
    pub fn set_healthcheck(&mut self, healthcheck: Option<HealthConfig>) {
        self.state_mut().docker_config.config.healthcheck = healthcheck;
    }

    pub fn healthcheck(&self) -> Option<&HealthConfig> {
        self.state().docker_config.config.healthcheck.as_ref()
    }

    /// Description of the next layer, recorded in its history entry.
    pub fn set_created_by(&mut self, created_by: &str) {
        self.state_mut().created_by = created_by.to_string();
    }

    pub fn created_by(&self) -> &str {
        &self.state().created_by
    }

    pub fn set_history_comment(&mut self, comment: &str) {
        self.state_mut().history_comment = comment.to_string();
    }

    /// Image-level comment (Docker `comment` field).
    pub fn set_comment(&mut self, comment: &str) {
        self.state_mut().docker_config.comment = comment.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{scratch_builder, setup};
    use crate::image::config::HealthConfig;

    #[tokio::test]
    async fn test_setters_apply_to_both_configs() {
        let (_dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        builder.set_cmd(vec!["nginx".into(), "-g".into()]);
        builder.set_entrypoint(vec!["/docker-entrypoint.sh".into()]);
        builder.set_env("PATH", "/usr/bin");
        builder.set_workdir("/srv");
        builder.set_user("www");
        builder.set_label("maintainer", "ops");
        builder.set_port("80").unwrap();
        builder.add_volume("/var/cache");
        builder.set_os("linux");
        builder.set_architecture("arm64");
        builder.set_variant("v8");

        for config in [builder.oci_config(), builder.docker_config()] {
            assert_eq!(config.config.cmd.as_deref(), Some(&["nginx".to_string(), "-g".to_string()][..]));
            assert_eq!(config.config.env_var("PATH"), Some("/usr/bin"));
            assert_eq!(config.config.working_dir, "/srv");
            assert_eq!(config.config.user, "www");
            assert_eq!(config.config.labels.get("maintainer").map(String::as_str), Some("ops"));
            assert!(config.config.exposed_ports.contains_key("80/tcp"));
            assert!(config.config.volumes.contains_key("/var/cache"));
            assert_eq!(config.architecture, "arm64");
            assert_eq!(config.variant, "v8");
        }

        builder.unset_label("maintainer");
        builder.unset_env("PATH");
        builder.unset_port("80/tcp").unwrap();
        assert!(builder.oci_config().config.labels.is_empty());
        assert!(builder.docker_config().config.env.is_empty());
        assert!(builder.docker_config().config.exposed_ports.is_empty());
        assert!(builder.set_port("eighty").is_err());
    }

    #[tokio::test]
    async fn test_healthcheck_is_docker_only() {
        let (_dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        builder.set_healthcheck(Some(HealthConfig {
            test: vec!["CMD".into(), "true".into()],
            retries: Some(3),
            ..HealthConfig::default()
        }));
        assert!(builder.healthcheck().is_some());
        assert!(builder.oci_config().config.healthcheck.is_none());
    }

    #[tokio::test]
    async fn test_annotations_and_history_fields() {
        let (_dir, context, store) = setup();
        let mut builder = scratch_builder(&context, &store).await;
        builder.set_annotation("org.example.key", "v");
        builder.set_created_by("/bin/sh -c make");
        builder.set_history_comment("built");
        assert_eq!(builder.state().image_annotations.len(), 1);
        assert_eq!(builder.created_by(), "/bin/sh -c make");
        builder.unset_annotation("org.example.key");
        assert!(builder.state().image_annotations.is_empty());
    }
}
