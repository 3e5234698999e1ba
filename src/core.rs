use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// A 32-byte BLAKE3 hash used for change detection.
///
/// In `kasane`, this serves two purposes:
/// 1. It is the fingerprint of a node: a digest over the node's key, its
///    literal parameters and the fingerprints and results of every upstream
///    node. Equal fingerprints across runs mean the node's action is redundant.
/// 2. It is the content hash of a node's encoded result, which downstream
///    fingerprints fold in so invalidation is transitive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash(buffer: impl AsRef<[u8]>) -> Self {
        blake3::Hasher::new()
            .update(buffer.as_ref())
            .finalize()
            .into()
    }

    /// Hashes anything implementing [`std::hash::Hash`] through BLAKE3.
    pub(crate) fn of<T: std::hash::Hash + ?Sized>(value: &T) -> Self {
        let mut hasher = Blake3Hasher::default();
        value.hash(&mut hasher);
        hasher.into()
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex()[..12])
    }
}

#[derive(Default)]
pub(crate) struct Blake3Hasher(blake3::Hasher);

impl Blake3Hasher {
    pub(crate) fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    /// Length-prefixed write, so adjacent strings cannot alias.
    pub(crate) fn update_str(&mut self, value: &str) -> &mut Self {
        self.0.update(&(value.len() as u64).to_le_bytes());
        self.0.update(value.as_bytes());
        self
    }
}

impl From<Blake3Hasher> for [u8; 32] {
    fn from(value: Blake3Hasher) -> Self {
        value.0.finalize().into()
    }
}

impl std::hash::Hasher for Blake3Hasher {
    fn finish(&self) -> u64 {
        let mut output = [0u8; 8];
        self.0.finalize_xof().fill(&mut output);
        u64::from_le_bytes(output)
    }

    fn write(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

/// The mode in which the orchestrator is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Export, upload, build and deploy every dependency.
    Release,
    /// Serve editable packages from their working copies.
    Workspace,
}

/// Runtime parameters of a single invocation.
///
/// This is threaded explicitly through the graph builder and the executor;
/// nothing in the crate reads run configuration from ambient state.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the YAML build specification.
    pub spec_file: Utf8PathBuf,
    /// Root folder for working copies, the snapshot and the journal.
    pub build_folder: Utf8PathBuf,
    /// Upload exported recipes and deploy built packages.
    pub upload: bool,
    /// Active dependency profile.
    pub profile: Option<String>,
    /// Serve editable packages from local working copies.
    pub workspace: bool,
    /// Glob restricting which dependencies are force-rebuilt.
    pub rebuild_filter: String,
    /// Delete working copies before cloning.
    pub wipe: bool,
    /// Size of the worker pool.
    pub workers: usize,
    /// Deadline for every single VCS or backend operation.
    pub timeout: Duration,
    /// Promote version-inspection fallbacks to hard errors.
    pub strict_versions: bool,
}

impl Settings {
    pub fn new(spec_file: impl Into<Utf8PathBuf>, build_folder: impl Into<Utf8PathBuf>) -> Self {
        Self {
            spec_file: spec_file.into(),
            build_folder: build_folder.into(),
            upload: false,
            profile: None,
            workspace: false,
            rebuild_filter: "*".into(),
            wipe: false,
            workers: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            timeout: Duration::from_secs(3600),
            strict_versions: false,
        }
    }

    pub fn mode(&self) -> Mode {
        if self.workspace {
            Mode::Workspace
        } else {
            Mode::Release
        }
    }

    pub(crate) fn journal_path(&self) -> Utf8PathBuf {
        self.build_folder.join(".kasane").join("journal.cbor")
    }
}

/// Run configuration plus shared services available to all node actions.
///
/// # Type Parameters
///
/// * `G`: The type of the services the actions need (gateways, locks). Must
///   be `Send + Sync`.
#[derive(Clone)]
pub struct Environment<G: Send + Sync = ()> {
    /// The name of the orchestrator (defaults to "kasane").
    pub generator: &'static str,
    /// Runtime parameters of this invocation.
    pub settings: Settings,
    /// Services shared by the node actions.
    pub data: G,
}

impl<G: Send + Sync> Environment<G> {
    pub fn new(settings: Settings, data: G) -> Self {
        Self {
            generator: "kasane",
            settings,
            data,
        }
    }
}

impl<G: Send + Sync> std::fmt::Debug for Environment<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("generator", &self.generator)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// The context passed to every node action.
pub struct TaskContext<'a, G: Send + Sync = ()> {
    /// Access to the run configuration and services.
    pub env: &'a Environment<G>,
    /// Stable key of the node being executed.
    pub key: &'a str,
    /// Tracing span assigned to this node.
    pub(crate) span: tracing::Span,
}

impl<G: Send + Sync> TaskContext<'_, G> {
    /// Updates the progress message of this node's spinner.
    pub fn status(&self, message: impl Into<String>) {
        use tracing_indicatif::span_ext::IndicatifSpanExt;

        let message: String = message.into();
        self.span.pb_set_message(&message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_length() {
        let hash = Hash32::hash(b"kasane");
        assert_eq!(hash.to_hex().len(), 64);
        assert_eq!(format!("{hash}").len(), 12);
    }

    #[test]
    fn test_hash_of_is_stable() {
        let a = Hash32::of(&("libfoo", "master", false));
        let b = Hash32::of(&("libfoo", "master", false));
        let c = Hash32::of(&("libfoo", "develop", false));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_update_str_is_prefix_free() {
        let mut a = Blake3Hasher::default();
        a.update_str("ab").update_str("c");
        let mut b = Blake3Hasher::default();
        b.update_str("a").update_str("bc");
        assert_ne!(Hash32::from(a), Hash32::from(b));
    }

    #[test]
    fn test_settings_mode() {
        let mut settings = Settings::new("spec.yml", "build");
        assert_eq!(settings.mode(), Mode::Release);
        settings.workspace = true;
        assert_eq!(settings.mode(), Mode::Workspace);
        assert_eq!(settings.journal_path(), "build/.kasane/journal.cbor");
    }
}
