//! Binding resolution: a registry keyed by name.
//!
//! Factories are registered in code at startup; the bindings root on disk
//! only contributes per-binding assets. `discover` cross-references the
//! two and warns about directories nothing is registered for.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::binding::{BindingFactory, LlmBinding, ModelEntry};
use crate::config::AppConfig;
use crate::error::BindingLoadError;

/// Name of the marker file that records a completed install hook.
const INSTALL_MARKER: &str = ".installed";

/// Maps binding names to their factories.
pub struct BindingRegistry {
    root: PathBuf,
    factories: HashMap<String, Arc<dyn BindingFactory>>,
}

impl std::fmt::Debug for BindingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingRegistry")
            .field("root", &self.root)
            .field("names", &self.names())
            .finish()
    }
}

impl BindingRegistry {
    /// An empty registry over the given bindings root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            factories: HashMap::new(),
        }
    }

    /// A registry pre-populated with the built-in factories.
    pub fn with_builtin(root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new(root);
        registry.register(Arc::new(super::openai::OpenAiFactory));
        registry.register(Arc::new(super::mock::MockFactory::default()));
        registry
    }

    /// Register a factory under its own name. Re-registering a name
    /// replaces the previous factory (latest wins).
    pub fn register(&mut self, factory: Arc<dyn BindingFactory>) {
        let name = factory.name().to_string();
        if self.factories.insert(name.clone(), factory).is_some() {
            log::debug!("binding factory `{name}` replaced");
        }
    }

    /// Registered binding names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// The asset directory for a binding.
    pub fn binding_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Scan the bindings root and report which registered bindings have an
    /// on-disk package. Directories with no registered factory are warned
    /// about and skipped; there is no path-based code loading.
    pub fn discover(&self) -> Vec<String> {
        let mut found = Vec::new();
        match fs::read_dir(&self.root) {
            Ok(entries) => {
                for entry in entries.filter_map(Result::ok) {
                    if !entry.path().is_dir() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if self.factories.contains_key(&name) {
                        found.push(name);
                    } else {
                        log::warn!(
                            "binding directory `{name}` under {} has no registered factory",
                            self.root.display()
                        );
                    }
                }
            }
            Err(e) => {
                log::debug!("bindings root {} not readable: {e}", self.root.display());
            }
        }
        found.sort();
        found
    }

    /// Resolve and construct the named binding.
    ///
    /// Runs the factory's install hook first when the binding has an
    /// on-disk package that was never installed.
    pub fn build(
        &self,
        name: &str,
        config: &AppConfig,
    ) -> Result<Box<dyn LlmBinding>, BindingLoadError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| BindingLoadError::Unknown {
                name: name.to_string(),
            })?;

        let dir = self.binding_dir(name);
        if dir.is_dir() {
            self.ensure_installed(factory.as_ref(), &dir)?;
        } else {
            log::debug!("binding `{name}` has no package directory at {}", dir.display());
        }

        factory.build(config, &dir)
    }

    /// Parse the binding's `models.yaml` listing.
    pub fn available_models(&self, name: &str) -> Result<Vec<ModelEntry>, BindingLoadError> {
        if !self.factories.contains_key(name) {
            return Err(BindingLoadError::Unknown {
                name: name.to_string(),
            });
        }
        let path = self.binding_dir(name).join("models.yaml");
        let raw = fs::read_to_string(&path).map_err(|e| BindingLoadError::ModelListing {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&raw).map_err(|e| BindingLoadError::ModelListing {
            path,
            reason: e.to_string(),
        })
    }

    /// Run the install hook once per binding directory.
    fn ensure_installed(
        &self,
        factory: &dyn BindingFactory,
        dir: &Path,
    ) -> Result<(), BindingLoadError> {
        let marker = dir.join(INSTALL_MARKER);
        if marker.exists() {
            return Ok(());
        }

        log::info!("running one-time install for binding `{}`", factory.name());
        factory.install(dir)?;

        let stamp = format!("installed {}\n", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"));
        fs::write(&marker, stamp).map_err(|e| BindingLoadError::Install {
            name: factory.name().to_string(),
            reason: format!("couldn't write install marker: {e}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::mock::MockFactory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        installs: AtomicUsize,
    }

    impl BindingFactory for CountingFactory {
        fn name(&self) -> &str {
            "counting"
        }

        fn build(
            &self,
            config: &AppConfig,
            dir: &Path,
        ) -> Result<Box<dyn LlmBinding>, BindingLoadError> {
            MockFactory::default().build(config, dir)
        }

        fn install(&self, _dir: &Path) -> Result<(), BindingLoadError> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_unknown_binding_is_an_error() {
        let registry = BindingRegistry::new("bindings");
        let err = registry
            .build("nope", &AppConfig::default())
            .err()
            .expect("should fail");
        assert!(matches!(err, BindingLoadError::Unknown { name } if name == "nope"));
    }

    #[test]
    fn test_install_hook_runs_once() {
        let root = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(root.path().join("counting")).expect("binding dir");

        let factory = Arc::new(CountingFactory {
            installs: AtomicUsize::new(0),
        });
        let mut registry = BindingRegistry::new(root.path());
        registry.register(factory.clone());

        let config = AppConfig::default();
        registry.build("counting", &config).expect("first build");
        registry.build("counting", &config).expect("second build");

        assert_eq!(factory.installs.load(Ordering::SeqCst), 1);
        assert!(root.path().join("counting").join(INSTALL_MARKER).exists());
    }

    #[test]
    fn test_available_models_parses_listing() {
        let root = tempfile::tempdir().expect("temp dir");
        let dir = root.path().join("mock");
        fs::create_dir_all(&dir).expect("binding dir");
        fs::write(
            dir.join("models.yaml"),
            "- name: tiny\n  filename: tiny.bin\n  license: MIT\n- name: big\n",
        )
        .expect("models.yaml");

        let registry = BindingRegistry::with_builtin(root.path());
        let models = registry.available_models("mock").expect("listing");
        assert_eq!(models.len(), 2);
        assert_eq!(models[0].name, "tiny");
        assert_eq!(models[0].filename.as_deref(), Some("tiny.bin"));
        assert!(models[1].filename.is_none());
    }

    #[test]
    fn test_discover_reports_known_directories() {
        let root = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(root.path().join("mock")).expect("mock dir");
        fs::create_dir_all(root.path().join("mystery")).expect("mystery dir");

        let registry = BindingRegistry::with_builtin(root.path());
        assert_eq!(registry.discover(), vec!["mock".to_string()]);
    }
}
