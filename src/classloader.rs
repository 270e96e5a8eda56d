//! Finding object classes by name.
//!
//! Classes live in modules, and modules are grouped into [`PluginPath`]s
//! searched in order. The module for class `Camera` is the first one whose
//! file stem is `camera` in any letter case; the module must then export a
//! descriptor named exactly `Camera`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ClassLoaderError;
use crate::object::{MethodError, ObjectContext, RemoteObject};
use crate::Value;

type Factory = Arc<dyn Fn(&ObjectContext) -> Result<Arc<dyn RemoteObject>, MethodError> + Send + Sync>;

/// How to build objects of one class.
#[derive(Clone)]
pub struct ClassDescriptor {
    name: String,
    interfaces: Vec<String>,
    options: BTreeMap<String, Value>,
    factory: Factory,
}

impl ClassDescriptor {
    pub fn new<F, O>(name: &str, factory: F) -> Self
    where
        F: Fn(&ObjectContext) -> Result<O, MethodError> + Send + Sync + 'static,
        O: RemoteObject,
    {
        Self {
            name: name.to_string(),
            interfaces: Vec::new(),
            options: BTreeMap::new(),
            factory: Arc::new(move |ctx| factory(ctx).map(|object| Arc::new(object) as Arc<dyn RemoteObject>)),
        }
    }

    /// Declare that objects of this class can stand in for `interface`.
    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(interface.to_string());
        self
    }

    /// Declare a configuration option and its default.
    pub fn option(mut self, key: &str, default: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), default.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Declared options with their defaults.
    pub fn options(&self) -> &BTreeMap<String, Value> {
        &self.options
    }

    pub fn construct(&self, ctx: &ObjectContext) -> Result<Arc<dyn RemoteObject>, MethodError> {
        (self.factory)(ctx)
    }
}

impl fmt::Debug for ClassDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDescriptor")
            .field("name", &self.name)
            .field("interfaces", &self.interfaces)
            .field("options", &self.options)
            .finish()
    }
}

type Loader = Arc<dyn Fn() -> Result<Vec<ClassDescriptor>, String> + Send + Sync>;

/// A loadable unit that exports classes.
#[derive(Clone)]
pub struct PluginModule {
    file: String,
    loader: Loader,
}

impl PluginModule {
    /// A module whose loading may fail.
    pub fn new<F>(file: &str, loader: F) -> Self
    where
        F: Fn() -> Result<Vec<ClassDescriptor>, String> + Send + Sync + 'static,
    {
        Self {
            file: file.to_string(),
            loader: Arc::new(loader),
        }
    }

    /// A module that always loads and exports `classes`.
    pub fn exporting(file: &str, classes: Vec<ClassDescriptor>) -> Self {
        Self::new(file, move || Ok(classes.clone()))
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    fn stem(&self) -> &str {
        self.file.split('.').next().unwrap_or(&self.file)
    }
}

/// A named, ordered catalog of modules.
#[derive(Clone)]
pub struct PluginPath {
    name: String,
    modules: Vec<PluginModule>,
}

impl PluginPath {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            modules: Vec::new(),
        }
    }

    pub fn with_module(mut self, module: PluginModule) -> Self {
        self.modules.push(module);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, class: &str) -> Option<&PluginModule> {
        self.modules.iter().find(|m| m.stem().eq_ignore_ascii_case(class))
    }
}

/// Resolves class names to descriptors and caches the result.
#[derive(Default)]
pub struct ClassLoader {
    cache: DashMap<String, ClassDescriptor>,
}

impl ClassLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self, class: &str, paths: &[PluginPath]) -> Result<ClassDescriptor, ClassLoaderError> {
        if let Some(cached) = self.cache.get(class) {
            return Ok(cached.clone());
        }

        let module = paths.iter().find_map(|path| path.find(class)).ok_or_else(|| {
            ClassLoaderError::ModuleNotFound {
                class: class.to_string(),
                searched: paths.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", "),
            }
        })?;

        let exports = (module.loader)().map_err(|reason| ClassLoaderError::ModuleBroken {
            class: class.to_string(),
            module: module.file.clone(),
            reason,
        })?;

        let descriptor = exports
            .into_iter()
            .find(|d| d.name == class)
            .ok_or_else(|| ClassLoaderError::ClassNotExported {
                class: class.to_string(),
                module: module.file.clone(),
            })?;

        tracing::debug!("Loaded class {} from {}", class, module.file);
        self.cache.insert(class.to_string(), descriptor.clone());
        Ok(descriptor)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
