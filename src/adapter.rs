//! Language adapters.
//!
//! An adapter knows how to start one family of debug backends. Everything else the engine
//! needs to know about a backend is declarative data in [`AdapterProfile`], the engine never
//! branches on a language name.

use crate::config::{
    AdapterConfig, Config, HitConditionSupport, PortRange, Timeouts, TransportKind,
};
use crate::error::{Error, Result};
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Backend capabilities and tuning consumed by the engine.
#[derive(Debug, Clone)]
pub struct AdapterProfile {
    pub language: String,
    /// `adapterID` of the `initialize` request.
    pub adapter_id: String,
    pub default_port: Option<u16>,
    pub fallback_ports: Option<PortRange>,
    pub transport: TransportKind,
    pub hit_conditions: HitConditionSupport,
    /// Wait for the `initialized` event before sending breakpoints.
    pub wait_for_initialized: bool,
    pub timeouts: Timeouts,
}

impl AdapterProfile {
    pub fn new(language: impl Into<String>) -> Self {
        let language = language.into();
        Self {
            adapter_id: language.clone(),
            language,
            default_port: None,
            fallback_ports: None,
            transport: TransportKind::Tcp,
            hit_conditions: HitConditionSupport::Full,
            wait_for_initialized: true,
            timeouts: Timeouts::default(),
        }
    }
}

/// Glue a language integration has to provide.
pub trait DebugAdapter: Send + Sync {
    fn profile(&self) -> &AdapterProfile;

    /// Command line starting the debug backend.
    ///
    /// # Arguments
    ///
    /// * `target`: program to debug
    /// * `host`: interface the backend should listen on
    /// * `port`: leased port, `None` for stdio backends
    /// * `args`: program arguments
    fn build_launch_command(
        &self,
        target: &str,
        host: &str,
        port: Option<u16>,
        args: &[String],
    ) -> anyhow::Result<Vec<String>>;

    /// Variables added to the backend environment.
    fn extra_environment(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Pattern matching backend process names.
    fn process_name_pattern(&self) -> Option<Regex> {
        None
    }

    /// Arguments of the DAP `launch` request.
    fn launch_arguments(&self, target: &str, args: &[String]) -> Value {
        json!({ "program": target, "args": args })
    }
}

/// Adapter described by an [`AdapterConfig`] command template.
///
/// Template elements `{host}`, `{port}` and `{program}` are substituted (also inside
/// larger strings), an element equal to `{args}` expands to the program arguments.
#[derive(Debug, Clone)]
pub struct TemplateAdapter {
    profile: AdapterProfile,
    command: Vec<String>,
    env: HashMap<String, String>,
    process_pattern: Option<Regex>,
}

impl TemplateAdapter {
    pub fn new(profile: AdapterProfile, command: Vec<String>) -> Self {
        Self {
            profile,
            command,
            env: HashMap::new(),
            process_pattern: None,
        }
    }

    /// Build adapter for `language` from its configuration section.
    ///
    /// A fallback range under `[ports.ranges]` takes precedence over the one in the adapter
    /// section.
    pub fn from_config(language: &str, adapter: &AdapterConfig, config: &Config) -> Result<Self> {
        if adapter.command.is_empty() {
            return Err(Error::Config(format!(
                "adapter `{language}`: empty command"
            )));
        }
        let process_pattern = adapter
            .process_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::Config(format!("adapter `{language}`: {e}")))?;

        let profile = AdapterProfile {
            language: language.to_string(),
            adapter_id: adapter
                .adapter_id
                .clone()
                .unwrap_or_else(|| language.to_string()),
            default_port: adapter.default_port,
            fallback_ports: config
                .ports
                .ranges
                .get(language)
                .copied()
                .or(adapter.fallback_ports),
            transport: adapter.transport,
            hit_conditions: adapter.hit_conditions,
            wait_for_initialized: adapter.wait_for_initialized,
            timeouts: config.timeouts,
        };
        Ok(Self {
            profile,
            command: adapter.command.clone(),
            env: adapter.env.clone(),
            process_pattern,
        })
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl DebugAdapter for TemplateAdapter {
    fn profile(&self) -> &AdapterProfile {
        &self.profile
    }

    fn build_launch_command(
        &self,
        target: &str,
        host: &str,
        port: Option<u16>,
        args: &[String],
    ) -> anyhow::Result<Vec<String>> {
        let mut argv = Vec::with_capacity(self.command.len() + args.len());
        for element in &self.command {
            if element == "{args}" {
                argv.extend(args.iter().cloned());
                continue;
            }
            let mut value = element.replace("{host}", host).replace("{program}", target);
            if value.contains("{port}") {
                let port = port.ok_or_else(|| {
                    anyhow::anyhow!(
                        "`{}` command uses {{port}} but no port was leased",
                        self.profile.language
                    )
                })?;
                value = value.replace("{port}", &port.to_string());
            }
            argv.push(value);
        }
        Ok(argv)
    }

    fn extra_environment(&self) -> HashMap<String, String> {
        self.env.clone()
    }

    fn process_name_pattern(&self) -> Option<Regex> {
        self.process_pattern.clone()
    }
}

/// Adapters by language.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn DebugAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding a [`TemplateAdapter`] for every `[adapters.*]` section.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        for (language, adapter) in &config.adapters {
            registry.register(Arc::new(TemplateAdapter::from_config(
                language, adapter, config,
            )?));
        }
        Ok(registry)
    }

    /// Add adapter, replacing a previous one for the same language.
    pub fn register(&mut self, adapter: Arc<dyn DebugAdapter>) {
        let language = adapter.profile().language.clone();
        if self.adapters.insert(language.clone(), adapter).is_some() {
            log::debug!(target: "engine", "adapter for `{language}` replaced");
        }
    }

    pub fn get(&self, language: &str) -> Result<Arc<dyn DebugAdapter>> {
        self.adapters
            .get(language)
            .cloned()
            .ok_or_else(|| Error::UnknownAdapter(language.to_string()))
    }

    pub fn languages(&self) -> Vec<String> {
        let mut languages: Vec<_> = self.adapters.keys().cloned().collect();
        languages.sort();
        languages
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("languages", &self.languages())
            .finish()
    }
}
