// Source location to class mapping
//
// Tracepoints name source files; the runtime knows classes. This module
// derives class-group keys from tracepoint paths and decides which loaded
// classes and which lines a tracepoint applies to.

use crate::config::AgentConfig;
use crate::instrument::ClassIr;
use crate::runtime::LoadedClass;
use crate::tracepoint::{args, TracepointDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Canonical identifier of the classes a tracepoint targets
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassGroupKey {
    /// Internal class name of the outermost class, e.g. `com/example/Foo`
    Class(String),
    /// All classes compiled from template-language files
    Templates,
}

impl fmt::Display for ClassGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassGroupKey::Class(name) => f.write_str(name),
            ClassGroupKey::Templates => f.write_str("templates"),
        }
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn extension(path: &str) -> Option<&str> {
    file_name(path).rsplit_once('.').map(|(_, ext)| ext)
}

fn strip_extension(path: &str) -> &str {
    let name_start = path.len() - file_name(path).len();
    match path[name_start..].rfind('.') {
        Some(dot) => &path[..name_start + dot],
        None => path,
    }
}

/// Internal name of the outermost class: `a/B$C$1` -> `a/B`
fn outer_class(name: &str) -> &str {
    match name.find('$') {
        Some(index) if index > 0 => &name[..index],
        _ => name,
    }
}

fn package_of(internal_name: &str) -> &str {
    internal_name.rsplit_once('/').map(|(pkg, _)| pkg).unwrap_or("")
}

fn simple_name(internal_name: &str) -> &str {
    internal_name.rsplit('/').next().unwrap_or(internal_name)
}

#[derive(Debug, Clone)]
pub struct ClassKeyResolver {
    source_roots: Vec<String>,
    template_extensions: Vec<String>,
}

impl ClassKeyResolver {
    pub fn new(source_roots: Vec<String>, template_extensions: Vec<String>) -> Self {
        Self {
            source_roots,
            template_extensions,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.source_roots.clone(), config.template_extensions.clone())
    }

    pub fn is_template_file(&self, path: &str) -> bool {
        extension(path)
            .map(|ext| {
                self.template_extensions
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }

    /// Best-effort class-group key for a tracepoint.
    ///
    /// An explicit `class` arg wins, template files share one group, and
    /// everything else is the path with its source root and extension removed.
    pub fn key_for(&self, tp: &TracepointDefinition) -> ClassGroupKey {
        if let Some(class) = tp.arg(args::CLASS) {
            let internal = class.trim_end_matches(".class").replace('.', "/");
            return ClassGroupKey::Class(outer_class(&internal).to_string());
        }

        if self.is_template_file(&tp.path) {
            return ClassGroupKey::Templates;
        }

        let normalized = tp.path.replace('\\', "/");
        let relative = self
            .source_roots
            .iter()
            .find_map(|root| normalized.find(root.as_str()).map(|at| &normalized[at + root.len()..]))
            .unwrap_or(normalized.as_str());

        let relative = relative.trim_start_matches('/');
        ClassGroupKey::Class(strip_extension(relative).to_string())
    }

    /// Whether a loaded class belongs to a class group
    pub fn matches(&self, key: &ClassGroupKey, class: &LoadedClass) -> bool {
        match key {
            ClassGroupKey::Templates => class
                .source_file
                .as_deref()
                .map(|f| self.is_template_file(f))
                .unwrap_or(false),
            ClassGroupKey::Class(name) => {
                if outer_class(&class.name) == name {
                    return true;
                }
                // secondary top-level classes declared in the same file
                package_of(&class.name) == package_of(name)
                    && class
                        .source_file
                        .as_deref()
                        .map(|f| strip_extension(f) == simple_name(name))
                        .unwrap_or(false)
            }
        }
    }

    /// Every group key a class could be targeted by
    pub fn keys_for_class(&self, class: &LoadedClass) -> Vec<ClassGroupKey> {
        let mut keys = vec![ClassGroupKey::Class(outer_class(&class.name).to_string())];
        if let Some(source) = class.source_file.as_deref() {
            if self.is_template_file(source) {
                keys.push(ClassGroupKey::Templates);
            } else {
                let package = package_of(&class.name);
                let sibling = if package.is_empty() {
                    strip_extension(source).to_string()
                } else {
                    format!("{}/{}", package, strip_extension(source))
                };
                let sibling = ClassGroupKey::Class(sibling);
                if !keys.contains(&sibling) {
                    keys.push(sibling);
                }
            }
        }
        keys
    }
}

/// Maps a tracepoint onto lines of a compiled class
pub trait LocationResolver: Send + Sync {
    /// Lines of `class` where `tp` should be installed; empty when it does not apply
    fn resolve_lines(&self, class: &ClassIr, tp: &TracepointDefinition) -> Vec<u32>;
}

/// Installs at the declared line when the class was compiled from the declared file
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectLineResolver;

impl LocationResolver for DirectLineResolver {
    fn resolve_lines(&self, class: &ClassIr, tp: &TracepointDefinition) -> Vec<u32> {
        match class.source_file.as_deref() {
            Some(source) if source == file_name(&tp.path) => vec![tp.line],
            _ => Vec::new(),
        }
    }
}
