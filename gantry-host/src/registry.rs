//! Module registry and builder
//!
//! The registry is the explicit replacement for filesystem convention
//! scanning: the embedding program declares its models, modules, and data
//! patches up front, and `build()` fixes the module structure before any
//! hook runs. Hooks are stored, never executed, at build time.
//!
//! A **module** bundles up to three artifacts under one name: a service
//! (long-lived object with an init hook), a router (mounted at
//! `/api/{name}` in web mode), and a scheduler hook (registers periodic
//! tasks in cron mode). **Models** live in a separate flat list; a model
//! sharing a module's name is merged into that module's structure entry.

use crate::app::App;
use crate::error::{Error, Result};
use crate::modes::cron::Scheduler;
use axum::Router;
use futures::future::BoxFuture;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

/// Module names that collide with built-in routes
const RESERVED_MODULE_NAMES: &[&str] = &["docs"];

/// Async model initialization hook; the returned handle is stored on the App
pub type ModelInit =
    Box<dyn Fn(App) -> BoxFuture<'static, Result<Arc<dyn Any + Send + Sync>>> + Send + Sync>;

/// Deferred service construction
pub type ServiceCtor = Box<dyn Fn() -> ServiceSlot + Send + Sync>;

/// Router factory invoked by web mode
pub type RouterFactory = Box<dyn Fn(&App) -> Router + Send + Sync>;

/// Scheduler registration hook invoked by cron mode
pub type SchedulerHook = Box<dyn Fn(&App, &mut Scheduler) + Send + Sync>;

/// Data patch body
pub type PatchFn = Box<dyn Fn(App) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A long-lived object participating in the host lifecycle
///
/// Constructed by its module's registered constructor during bootstrap;
/// `init` runs after every model hook and after the init of every service
/// registered earlier, so a later service may rely on earlier ones.
#[async_trait::async_trait]
pub trait Service: Send + Sync {
    async fn init(&self, app: &App) -> Result<()>;
}

/// Both faces of one service instance: the lifecycle trait object and a
/// type-erased handle for typed retrieval
pub struct ServiceSlot {
    pub(crate) service: Arc<dyn Service>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

/// Artifacts contributed by one module
#[derive(Default)]
pub struct ModuleDef {
    pub(crate) service: Option<ServiceCtor>,
    pub(crate) router: Option<RouterFactory>,
    pub(crate) scheduler: Option<SchedulerHook>,
}

impl ModuleDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a service constructor
    pub fn service<S, F>(mut self, ctor: F) -> Self
    where
        S: Service + 'static,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.service = Some(Box::new(move || {
            let service = Arc::new(ctor());
            ServiceSlot {
                service: service.clone(),
                any: service,
            }
        }));
        self
    }

    /// Attach a router factory
    pub fn router<F>(mut self, factory: F) -> Self
    where
        F: Fn(&App) -> Router + Send + Sync + 'static,
    {
        self.router = Some(Box::new(factory));
        self
    }

    /// Attach a scheduler registration hook
    pub fn scheduler<F>(mut self, hook: F) -> Self
    where
        F: Fn(&App, &mut Scheduler) + Send + Sync + 'static,
    {
        self.scheduler = Some(Box::new(hook));
        self
    }
}

/// A registered data patch
pub struct Patch {
    pub(crate) version: i64,
    pub(crate) name: String,
    pub(crate) run: PatchFn,
}

/// Which artifacts a module contributes; fixed at build time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModuleArtifacts {
    pub model: bool,
    pub service: bool,
    pub router: bool,
    pub scheduler: bool,
}

/// Insertion-ordered map of module name to contributed artifacts
///
/// Standalone models come first in registration order, then modules; a
/// model named like a module folds into the module's entry.
#[derive(Debug, Clone, Default)]
pub struct ModuleStructure {
    entries: Vec<(String, ModuleArtifacts)>,
}

impl ModuleStructure {
    pub fn get(&self, name: &str) -> Option<&ModuleArtifacts> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, artifacts)| artifacts)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ModuleArtifacts)> {
        self.entries
            .iter()
            .map(|(name, artifacts)| (name.as_str(), artifacts))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn upsert(&mut self, name: &str, apply: impl FnOnce(&mut ModuleArtifacts)) {
        match self.entries.iter_mut().find(|(entry, _)| entry == name) {
            Some((_, artifacts)) => apply(artifacts),
            None => {
                let mut artifacts = ModuleArtifacts::default();
                apply(&mut artifacts);
                self.entries.push((name.to_string(), artifacts));
            }
        }
    }
}

/// The validated module set consumed by the host
pub struct ModuleRegistry {
    pub(crate) models: Vec<(String, ModelInit)>,
    pub(crate) modules: Vec<(String, ModuleDef)>,
    pub(crate) patches: Vec<Patch>,
    pub(crate) structure: Arc<ModuleStructure>,
}

impl Default for ModuleRegistry {
    /// The empty module set
    fn default() -> Self {
        ModuleRegistry {
            models: Vec::new(),
            modules: Vec::new(),
            patches: Vec::new(),
            structure: Arc::new(ModuleStructure::default()),
        }
    }
}

impl ModuleRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn structure(&self) -> Arc<ModuleStructure> {
        self.structure.clone()
    }
}

/// Collects declarations; `build()` validates and fixes the structure
#[derive(Default)]
pub struct RegistryBuilder {
    models: Vec<(String, ModelInit)>,
    modules: Vec<(String, ModuleDef)>,
    patches: Vec<(String, PatchFn)>,
}

impl RegistryBuilder {
    /// Register a model init hook under `name`
    ///
    /// Hooks run in registration order during bootstrap; the returned
    /// value becomes the handle `App::model` hands back.
    pub fn model<M, F, Fut>(mut self, name: &str, hook: F) -> Self
    where
        M: Send + Sync + 'static,
        F: Fn(App) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<M>> + Send + 'static,
    {
        let wrapped: ModelInit = Box::new(
            move |app| -> BoxFuture<'static, Result<Arc<dyn Any + Send + Sync>>> {
                let fut = hook(app);
                Box::pin(async move {
                    let model = fut.await?;
                    Ok(Arc::new(model) as Arc<dyn Any + Send + Sync>)
                })
            },
        );
        self.models.push((name.to_string(), wrapped));
        self
    }

    /// Register a module and its artifacts under `name`
    pub fn module(mut self, name: &str, def: ModuleDef) -> Self {
        self.modules.push((name.to_string(), def));
        self
    }

    /// Register a data patch
    ///
    /// The script name's leading integer is its version id:
    /// `"0002_backfill_tags"` is patch 2. Versions start at 1 and must be
    /// unique; renumbering a shipped patch corrupts the applied-version
    /// bookkeeping.
    pub fn patch<F, Fut>(mut self, script_name: &str, body: F) -> Self
    where
        F: Fn(App) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let run: PatchFn =
            Box::new(move |app| -> BoxFuture<'static, Result<()>> { Box::pin(body(app)) });
        self.patches.push((script_name.to_string(), run));
        self
    }

    /// Validate the declarations and fix the module structure
    pub fn build(self) -> Result<ModuleRegistry> {
        let mut seen = HashSet::new();
        for (name, _) in &self.models {
            validate_name(name, "model")?;
            if !seen.insert(name.clone()) {
                return Err(Error::Registry(format!("duplicate model '{}'", name)));
            }
        }

        seen.clear();
        for (name, _) in &self.modules {
            validate_name(name, "module")?;
            if RESERVED_MODULE_NAMES.contains(&name.as_str()) {
                return Err(Error::Registry(format!("module name '{}' is reserved", name)));
            }
            if !seen.insert(name.clone()) {
                return Err(Error::Registry(format!("duplicate module '{}'", name)));
            }
        }

        let mut patches = Vec::with_capacity(self.patches.len());
        let mut versions = HashSet::new();
        for (name, run) in self.patches {
            let version = parse_patch_version(&name)?;
            if !versions.insert(version) {
                return Err(Error::Registry(format!(
                    "duplicate patch version {} ('{}')",
                    version, name
                )));
            }
            patches.push(Patch { version, name, run });
        }

        let mut structure = ModuleStructure::default();
        for (name, _) in &self.models {
            structure.upsert(name, |artifacts| artifacts.model = true);
        }
        for (name, def) in &self.modules {
            structure.upsert(name, |artifacts| {
                artifacts.service = def.service.is_some();
                artifacts.router = def.router.is_some();
                artifacts.scheduler = def.scheduler.is_some();
            });
        }

        Ok(ModuleRegistry {
            models: self.models,
            modules: self.modules,
            patches,
            structure: Arc::new(structure),
        })
    }
}

fn validate_name(name: &str, kind: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Registry(format!(
            "invalid {} name {:?} (allowed: [a-z0-9_]+)",
            kind, name
        )))
    }
}

/// Parse the leading integer of a patch script name
fn parse_patch_version(script_name: &str) -> Result<i64> {
    let digits: String = script_name
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return Err(Error::Registry(format!(
            "patch '{}' has no leading version id",
            script_name
        )));
    }
    let version: i64 = digits.parse().map_err(|_| {
        Error::Registry(format!("patch '{}' version id out of range", script_name))
    })?;
    if version < 1 {
        return Err(Error::Registry(format!(
            "patch '{}' must have a version id of 1 or higher",
            script_name
        )));
    }
    Ok(version)
}
