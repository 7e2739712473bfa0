//! Bring an image into the local store.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stevedore_shared::constants::retry::{MAX_PULL_ATTEMPTS, PULL_BACKOFF_BASE_MS};
use stevedore_shared::errors::{StevedoreError, StevedoreResult};
use tracing::{debug, info, warn};

use super::copy::{CopyOptions, CopyReport, copy_image};
use super::manifest::ManifestType;
use super::policy::Policy;
use super::reference::{ImageReference, ResolveOptions, Transport, parse_named, resolve};
use super::transports::{open_destination, open_source};
use crate::storage::{ImageRecord, Store};
use crate::system::SystemContext;
use crate::util::digest::digest_hex;

/// When to contact the image source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullPolicy {
    /// Use the local image when present.
    #[default]
    #[serde(alias = "missing")]
    IfMissing,
    Always,
    /// Never copy; fail when the image is not already local.
    Never,
}

impl FromStr for PullPolicy {
    type Err = StevedoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "missing" | "ifmissing" | "if-missing" => Ok(PullPolicy::IfMissing),
            "always" | "true" => Ok(PullPolicy::Always),
            "never" | "false" => Ok(PullPolicy::Never),
            other => Err(StevedoreError::InvalidArgument(format!(
                "unrecognized pull policy {:?}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PullOptions {
    pub policy: PullPolicy,
    /// Registry tried first for unqualified names.
    pub registry: Option<String>,
    /// Transport used for specs without one; defaults to the context's.
    pub transport: Option<String>,
    pub manifest_type: Option<ManifestType>,
    pub all_instances: bool,
    /// Initial retry delay. `None` uses the one-second default.
    pub retry_delay: Option<Duration>,
}

/// Result of a successful pull.
#[derive(Clone, Debug)]
pub struct PulledImage {
    /// `containers-storage:` reference to the local image.
    pub reference: ImageReference,
    pub local_name: String,
    pub image: ImageRecord,
}

/// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, …
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
}

/// Run `op` until it succeeds, fails with an error that is not transient,
/// or has been tried `MAX_PULL_ATTEMPTS` times. The delay before retry `n`
/// is `backoff_delay(base, n)`.
pub async fn retry_transient<T, F, Fut>(what: &str, base: Duration, mut op: F) -> StevedoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StevedoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < MAX_PULL_ATTEMPTS => {
                let delay = backoff_delay(base, attempt);
                warn!(
                    source = what,
                    attempt,
                    max = MAX_PULL_ATTEMPTS,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Pull failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Look up an image by name, normalized name, `@<hex>` or ID.
pub fn find_local_image(store: &dyn Store, name: &str) -> StevedoreResult<ImageRecord> {
    if let Some(hex) = name.strip_prefix('@') {
        return store.image(hex);
    }
    match store.image(name) {
        Ok(image) => Ok(image),
        Err(StevedoreError::ImageUnknown(_)) => match parse_named(name) {
            Ok(named) if named.whole() != name => store.image(&named.whole()),
            _ => Err(StevedoreError::ImageUnknown(name.to_string())),
        },
        Err(e) => Err(e),
    }
}

fn storage_reference(local_name: &str, id: Option<&str>) -> StevedoreResult<ImageReference> {
    match local_name.strip_prefix('@') {
        Some(_) => Ok(ImageReference {
            transport: Transport::ContainersStorage,
            path: None,
            named: None,
            inner: None,
            id: id.map(str::to_string),
        }),
        None => ImageReference::storage(local_name),
    }
}

pub struct Puller {
    context: SystemContext,
    store: Arc<dyn Store>,
}

impl Puller {
    pub fn new(context: SystemContext, store: Arc<dyn Store>) -> Self {
        Self { context, store }
    }

    /// Resolve `spec` and make sure the image is in the local store.
    pub async fn pull(&self, spec: &str, options: &PullOptions) -> StevedoreResult<PulledImage> {
        if options.policy != PullPolicy::Always {
            if let Ok(image) = find_local_image(self.store.as_ref(), spec) {
                debug!(spec, image = %image.id, "Image already local");
                return Ok(PulledImage {
                    reference: storage_reference("@", Some(&image.id))?,
                    local_name: spec.to_string(),
                    image,
                });
            }
        }

        let transport = options
            .transport
            .clone()
            .unwrap_or_else(|| self.context.default_transport.clone());
        let resolve_options = ResolveOptions {
            registry: options.registry.as_deref(),
            search_registries: &self.context.registries,
            transport: Some(&transport),
        };
        let resolved = match resolve(spec, &resolve_options) {
            Ok(resolved) => resolved,
            Err(e) if options.policy == PullPolicy::Never => {
                debug!(spec, error = %e, "Unresolvable and pull disabled");
                return Err(StevedoreError::NotLocal(spec.to_string()));
            }
            Err(e) => return Err(e),
        };

        if options.policy != PullPolicy::Always {
            if let Ok(image) = find_local_image(self.store.as_ref(), &resolved.local_name) {
                return Ok(PulledImage {
                    reference: storage_reference(&resolved.local_name, Some(&image.id))?,
                    local_name: resolved.local_name,
                    image,
                });
            }
        }
        if options.policy == PullPolicy::Never {
            return Err(StevedoreError::NotLocal(spec.to_string()));
        }

        let policy = Policy::from_file(&self.context.policy_path())?;
        let dest_ref = storage_reference(&resolved.local_name, None)?;
        let report = self
            .copy_with_retry(&policy, &resolved.reference, &dest_ref, options)
            .await?;

        let id = match &report.config_digest {
            Some(config) => digest_hex(config)?.to_string(),
            None => digest_hex(&report.manifest_digest)?.to_string(),
        };
        let image = self.store.image(&id)?;
        info!(source = %resolved.reference, name = %resolved.local_name, image = %image.id, "Pulled image");
        Ok(PulledImage {
            reference: storage_reference(&resolved.local_name, Some(&image.id))?,
            local_name: resolved.local_name,
            image,
        })
    }

    async fn copy_with_retry(
        &self,
        policy: &Policy,
        source: &ImageReference,
        dest: &ImageReference,
        options: &PullOptions,
    ) -> StevedoreResult<CopyReport> {
        let base = options
            .retry_delay
            .unwrap_or(Duration::from_millis(PULL_BACKOFF_BASE_MS));
        let copy_options = CopyOptions {
            manifest_type: options.manifest_type,
            all_instances: options.all_instances,
            scratch: Some(self.store.tmp_dir()),
            ..CopyOptions::default()
        };

        let copy_options = &copy_options;
        retry_transient(&source.to_string(), base, move || {
            self.copy_once(policy, source, dest, copy_options)
        })
        .await
    }

    async fn copy_once(
        &self,
        policy: &Policy,
        source: &ImageReference,
        dest: &ImageReference,
        options: &CopyOptions,
    ) -> StevedoreResult<CopyReport> {
        let src = open_source(source, &self.context, &self.store)?;
        let dst = open_destination(dest, &self.context, &self.store)?;
        let result = copy_image(policy, src.as_ref(), dst.as_ref(), options).await;
        if let Err(e) = src.close().await {
            warn!(source = %source, error = %e, "Failed to close image source");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;

    fn setup() -> (tempfile::TempDir, SystemContext, Arc<dyn Store>) {
        let dir = tempfile::tempdir().unwrap();
        let policy = dir.path().join("policy.json");
        std::fs::write(&policy, r#"{"default": [{"type": "insecureAcceptAnything"}]}"#).unwrap();
        let context = SystemContext::with_root(dir.path()).with_signature_policy(&policy);
        let store: Arc<dyn Store> = Arc::new(LocalStore::open(context.layout()).unwrap());
        (dir, context, store)
    }

    #[test]
    fn test_pull_policy_parse() {
        assert_eq!("missing".parse::<PullPolicy>().unwrap(), PullPolicy::IfMissing);
        assert_eq!("Always".parse::<PullPolicy>().unwrap(), PullPolicy::Always);
        assert_eq!("never".parse::<PullPolicy>().unwrap(), PullPolicy::Never);
        assert!("sometimes".parse::<PullPolicy>().is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(4));
    }

    /// Run `retry_transient` over a fixed sequence of results, returning the
    /// outcome and how many attempts were made.
    async fn run_attempts(
        mut results: Vec<StevedoreResult<u32>>,
    ) -> (StevedoreResult<u32>, usize) {
        results.reverse();
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let results = parking_lot::Mutex::new(results);
        let outcome = retry_transient("test", Duration::from_millis(1), || {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let next = results
                .lock()
                .pop()
                .unwrap_or_else(|| Err(StevedoreError::Internal("exhausted".into())));
            async move { next }
        })
        .await;
        (outcome, calls.into_inner())
    }

    fn network() -> StevedoreError {
        StevedoreError::Network("connection reset".into())
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let mut results: Vec<_> = (1..MAX_PULL_ATTEMPTS).map(|_| Err(network())).collect();
        results.push(Ok(7));
        let (outcome, calls) = run_attempts(results).await;
        assert_eq!(outcome.unwrap(), 7);
        assert_eq!(calls, MAX_PULL_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_transient_errors_give_up_after_max_attempts() {
        let results = (0..MAX_PULL_ATTEMPTS + 2).map(|_| Err(network())).collect();
        let (outcome, calls) = run_attempts(results).await;
        assert!(outcome.unwrap_err().is_transient());
        assert_eq!(calls, MAX_PULL_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn test_permanent_error_tried_once() {
        let results = vec![Err(StevedoreError::Image("bad manifest".into())), Ok(1)];
        let (outcome, calls) = run_attempts(results).await;
        assert!(matches!(outcome, Err(StevedoreError::Image(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_unknown_layer_is_retried() {
        let (_dir, _context, store) = setup();
        let missing = "e".repeat(64);
        let layer_error = store
            .put_layer(Some(&missing), &mut std::io::empty(), None)
            .unwrap_err();
        let (outcome, calls) = run_attempts(vec![Err(layer_error), Ok(3)]).await;
        assert_eq!(outcome.unwrap(), 3);
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_never_absent_is_not_local() {
        let (_dir, context, store) = setup();
        let puller = Puller::new(context, store);
        let options = PullOptions {
            policy: PullPolicy::Never,
            ..PullOptions::default()
        };
        let err = puller.pull("quay.io/nobody/nothing:1", &options).await.unwrap_err();
        assert!(matches!(err, StevedoreError::NotLocal(_)));

        let err = puller.pull("bare", &options).await.unwrap_err();
        assert!(matches!(err, StevedoreError::NotLocal(_)));
    }

    #[tokio::test]
    async fn test_if_missing_uses_local_image() {
        let (_dir, context, store) = setup();
        store
            .create_image(&"b".repeat(64), None, &["quay.io/team/app:1".to_string()])
            .unwrap();
        let puller = Puller::new(context, store);
        let pulled = puller
            .pull("quay.io/team/app:1", &PullOptions::default())
            .await
            .unwrap();
        assert_eq!(pulled.image.id, "b".repeat(64));
    }

    #[tokio::test]
    async fn test_bare_name_without_registry_is_invalid() {
        let (_dir, context, store) = setup();
        let puller = Puller::new(context, store);
        let err = puller.pull("alpine", &PullOptions::default()).await.unwrap_err();
        assert!(matches!(err, StevedoreError::InvalidReference(_)));
    }
}
