//! Script graph analysis
//!
//! Resolves a script reference to a fully validated, cycle-free graph of
//! script configurations. Every shape violation, unresolved reference, and
//! cycle becomes a [`Diagnostic`]; the analyzer batches them so one run can
//! report every independent problem. Nothing here throws for user mistakes.
//!
//! The graph is an arena ([`ScriptGraph`]) indexed by [`ConfigId`]: dependency
//! and reverse-dependency edges are stored as indices, never as owning
//! pointers both ways.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::diagnostic::{Diagnostic, DiagnosticPrinter, Location};
use crate::manifest::{JsonKind, JsonValue, ManifestLoader, PackageJson};

/// The sentinel command a wireit-configured script must have in `scripts`.
pub const WIREIT_COMMAND: &str = "wireit";

/// Identity of a script: package directory plus script name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptReference {
    pub package_dir: PathBuf,
    pub name: String,
}

impl ScriptReference {
    pub fn new(package_dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            package_dir: package_dir.into(),
            name: name.into(),
        }
    }

    /// Canonical map key: `packageDir\0name`. The NUL separator cannot occur
    /// in either component.
    pub fn to_key(&self) -> String {
        format!("{}\0{}", self.package_dir.display(), self.name)
    }

    /// Human label: bare name inside the root package, `relative/path:name`
    /// elsewhere.
    pub fn label(&self, root_package: &Path) -> String {
        if self.package_dir == root_package {
            self.name.clone()
        } else {
            format!(
                "{}:{}",
                relative_path(root_package, &self.package_dir),
                self.name
            )
        }
    }
}

/// Index into the analysis arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigId(pub usize);

/// A dependency edge with the source span of its declaration.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub config: ConfigId,
    pub specifier_location: Location,
}

/// Output-cleaning policy for one-shot scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanPolicy {
    /// `clean: true` (the default): delete declared outputs before running.
    Always,
    /// `clean: false`: never delete outputs.
    Never,
    /// `clean: "if-file-deleted"`: delete outputs only when an input file
    /// disappeared since the previous run.
    IfFileDeleted,
}

/// The three execution shapes a script can have.
#[derive(Debug, Clone)]
pub enum ScriptKind {
    /// Dependencies only; nothing to execute.
    NoCommand,
    /// A command expected to run to completion.
    OneShot {
        command: String,
        files: Option<Vec<String>>,
        output: Option<Vec<String>>,
        clean: CleanPolicy,
    },
    /// A command that runs until its consumers are done with it.
    Service { command: String },
}

/// A validated script configuration node.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    pub reference: ScriptReference,
    /// Span of the script's declaration, for diagnostics about the script as
    /// a whole.
    pub declaration: Location,
    pub kind: ScriptKind,
    pub dependencies: Vec<Dependency>,
    /// Populated during analysis; edges point back at dependent scripts.
    pub reverse_dependencies: Vec<ConfigId>,
    /// Lock filenames folded into the fingerprint (walked up the tree).
    pub package_locks: Vec<String>,
}

impl ScriptConfig {
    pub fn command(&self) -> Option<&str> {
        match &self.kind {
            ScriptKind::NoCommand => None,
            ScriptKind::OneShot { command, .. } | ScriptKind::Service { command } => Some(command),
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self.kind, ScriptKind::Service { .. })
    }

    pub fn files(&self) -> Option<&[String]> {
        match &self.kind {
            ScriptKind::OneShot { files, .. } => files.as_deref(),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&[String]> {
        match &self.kind {
            ScriptKind::OneShot { output, .. } => output.as_deref(),
            _ => None,
        }
    }
}

/// Arena of script configurations.
#[derive(Debug, Default)]
pub struct ScriptGraph {
    configs: Vec<ScriptConfig>,
}

impl ScriptGraph {
    pub fn get(&self, id: ConfigId) -> &ScriptConfig {
        &self.configs[id.0]
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConfigId, &ScriptConfig)> {
        self.configs
            .iter()
            .enumerate()
            .map(|(i, c)| (ConfigId(i), c))
    }
}

/// A successful analysis: the arena, the entry script, and every manifest
/// that was read along the way.
#[derive(Debug)]
pub struct Analysis {
    pub graph: ScriptGraph,
    pub root: ConfigId,
    pub root_package: PathBuf,
    pub manifests: Vec<Arc<PackageJson>>,
}

impl Analysis {
    pub fn config(&self, id: ConfigId) -> &ScriptConfig {
        self.graph.get(id)
    }

    pub fn label(&self, id: ConfigId) -> String {
        self.graph.get(id).reference.label(&self.root_package)
    }
}

/// Resolves an entry script into a validated graph.
pub struct Analyzer {
    loader: ManifestLoader,
    diagnostics: Vec<Diagnostic>,
    /// Completed or in-flight nodes by reference key.
    index: HashMap<String, ConfigId>,
    /// Nodes whose configuration was invalid (diagnostics already emitted).
    failed: HashSet<String>,
    /// Manifests whose load failure was already reported.
    reported_load_failures: HashSet<PathBuf>,
    configs: Vec<Option<ScriptConfig>>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            loader: ManifestLoader::new(),
            diagnostics: Vec::new(),
            index: HashMap::new(),
            failed: HashSet::new(),
            reported_load_failures: HashSet::new(),
            configs: Vec::new(),
        }
    }

    /// Paths of every manifest successfully read so far, whether or not
    /// analysis succeeded (the watcher re-watches these after a failed
    /// analysis).
    pub fn loaded_manifests(&self) -> Vec<PathBuf> {
        self.loader.loaded().map(|m| m.path.clone()).collect()
    }

    /// A printer loaded with the source of every manifest read so far.
    /// Usable whether or not analysis succeeded.
    pub fn printer(&self, cwd: impl Into<PathBuf>) -> DiagnosticPrinter {
        let mut printer = DiagnosticPrinter::new(cwd);
        for manifest in self.loader.loaded() {
            printer.add_source(manifest.path.clone(), manifest.source.clone());
        }
        printer
    }

    /// Analyze the graph rooted at `entry`. All diagnostics found anywhere in
    /// the graph are returned together on failure.
    pub fn analyze(mut self, entry: &ScriptReference) -> Result<Analysis, (Self, Vec<Diagnostic>)> {
        let entry = ScriptReference::new(normalize_path(&entry.package_dir), &entry.name);
        let mut stack = Vec::new();
        let root = self.analyze_script(&entry, &mut stack, None, &entry.package_dir);

        if !self.diagnostics.is_empty() {
            let diagnostics = std::mem::take(&mut self.diagnostics);
            return Err((self, diagnostics));
        }

        // No diagnostics means every placeholder was filled.
        let root = root.expect("analysis succeeded without a root config");
        let configs = std::mem::take(&mut self.configs)
            .into_iter()
            .map(|c| c.expect("config filled"))
            .collect();

        Ok(Analysis {
            graph: ScriptGraph { configs },
            root,
            root_package: entry.package_dir.clone(),
            manifests: self.loader.loaded().cloned().collect(),
        })
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    /// Recursive descent over the dependency graph. `stack` is the DFS path
    /// used for cycle detection; `referrer` is the span of the dependency
    /// specifier that led here, used when this script cannot be resolved.
    fn analyze_script(
        &mut self,
        reference: &ScriptReference,
        stack: &mut Vec<ScriptReference>,
        referrer: Option<&Location>,
        root_package: &Path,
    ) -> Option<ConfigId> {
        // Cycle check first: in-flight nodes are exactly the stack, and the
        // index would otherwise hand back their placeholder.
        if stack.contains(reference) {
            self.report_cycle(reference, stack, referrer, root_package);
            return None;
        }

        let key = reference.to_key();
        if self.failed.contains(&key) {
            return None;
        }
        if let Some(&id) = self.index.get(&key) {
            return Some(id);
        }

        let manifest = match self.loader.load(&reference.package_dir) {
            Ok(manifest) => manifest,
            Err(diagnostic) => {
                if self
                    .reported_load_failures
                    .insert(reference.package_dir.clone())
                {
                    self.report(diagnostic);
                }
                self.failed.insert(key);
                return None;
            }
        };

        let Some(resolved) = self.resolve_declaration(reference, &manifest, referrer) else {
            self.failed.insert(key);
            return None;
        };

        // Allocate the placeholder before descending so children can record
        // their reverse-dependency edge.
        let id = ConfigId(self.configs.len());
        self.configs.push(None);
        self.index.insert(key.clone(), id);

        stack.push(reference.clone());
        let dependencies =
            self.resolve_dependencies(reference, &manifest, &resolved, stack, root_package, id);
        stack.pop();

        let config = match self.validate(reference, &manifest, resolved, dependencies) {
            Some(config) => config,
            None => {
                self.index.remove(&key);
                self.failed.insert(key);
                // Leave the placeholder empty; analysis already failed.
                return None;
            }
        };

        self.configs[id.0] = Some(config);
        Some(id)
    }

    fn report_cycle(
        &mut self,
        reference: &ScriptReference,
        stack: &[ScriptReference],
        referrer: Option<&Location>,
        root_package: &Path,
    ) {
        let start = stack
            .iter()
            .position(|r| r == reference)
            .unwrap_or_default();

        let mut trail = String::new();
        let cycle: Vec<&ScriptReference> = stack[start..].iter().chain([reference]).collect();
        for (i, entry) in cycle.iter().enumerate() {
            let prefix = if i == 0 {
                ".-> "
            } else if i == cycle.len() - 1 {
                "`-- "
            } else {
                "|   "
            };
            trail.push_str(prefix);
            trail.push_str(&entry.label(root_package));
            if i != cycle.len() - 1 {
                trail.push('\n');
            }
        }

        let location = referrer.cloned().unwrap_or_else(|| {
            Location::new(reference.package_dir.join("package.json"), 0, 0)
        });
        self.report(Diagnostic::error(
            format!(
                "Cycle detected in dependencies of \"{}\".\n{}",
                reference.label(root_package),
                trail
            ),
            location,
        ));
    }

    /// Find the script's `scripts` entry and (optional) wireit stanza, and
    /// check the sentinel invariant between them.
    fn resolve_declaration(
        &mut self,
        reference: &ScriptReference,
        manifest: &Arc<PackageJson>,
        referrer: Option<&Location>,
    ) -> Option<Declaration> {
        let path = &manifest.path;

        let scripts = match manifest.scripts() {
            Some(scripts) => scripts,
            None => {
                let location = referrer.cloned().unwrap_or_else(|| manifest.file_location());
                self.report(Diagnostic::error(
                    format!("{} has no \"scripts\" section", path.display()),
                    location,
                ));
                return None;
            }
        };

        if scripts.value.as_object().is_none() {
            self.report(Diagnostic::error(
                "The \"scripts\" section must be an object",
                scripts.value.location(path),
            ));
            return None;
        }

        let script = match manifest.script(&reference.name) {
            Some(script) => script,
            None => {
                let location = referrer
                    .cloned()
                    .unwrap_or_else(|| scripts.name_location(path));
                self.report(Diagnostic::error(
                    format!(
                        "Script \"{}\" not found in the scripts section of {}",
                        reference.name,
                        path.display()
                    ),
                    location,
                ));
                return None;
            }
        };

        let Some(surface_command) = script.value.as_str() else {
            self.report(Diagnostic::error(
                "Scripts must be strings",
                script.value.location(path),
            ));
            return None;
        };

        // The wireit section, when present, must be a mapping.
        let wireit_config = match manifest.wireit() {
            Some(wireit) if wireit.value.as_object().is_none() => {
                self.report(Diagnostic::error(
                    "The \"wireit\" section must be an object",
                    wireit.value.location(path),
                ));
                return None;
            }
            Some(_) => manifest.wireit_script(&reference.name),
            None => None,
        };

        match (surface_command == WIREIT_COMMAND, wireit_config) {
            (true, Some(config)) => Some(Declaration {
                config: Some(config.value.clone()),
                config_location: config.name_location(path),
                surface_command: None,
            }),
            (false, Some(config)) => {
                self.report(
                    Diagnostic::error(
                        format!(
                            "Script \"{}\" is configured in the wireit section, \
                             but its scripts command is not \"wireit\"",
                            reference.name
                        ),
                        script.value.location(path),
                    )
                    .with_supplemental(vec![config.name_location(path)]),
                );
                None
            }
            (true, None) => {
                self.report(Diagnostic::error(
                    format!(
                        "Script \"{}\" runs the wireit command, but has no config \
                         in the wireit section",
                        reference.name
                    ),
                    script.value.location(path),
                ));
                None
            }
            (false, None) => Some(Declaration {
                config: None,
                config_location: script.name_location(path),
                surface_command: Some(surface_command.to_string()),
            }),
        }
    }

    /// Validate and resolve the `dependencies` array, recursing into each
    /// target. Edges to children are returned; reverse edges are recorded on
    /// the children as we go.
    fn resolve_dependencies(
        &mut self,
        reference: &ScriptReference,
        manifest: &Arc<PackageJson>,
        declaration: &Declaration,
        stack: &mut Vec<ScriptReference>,
        root_package: &Path,
        id: ConfigId,
    ) -> Vec<Dependency> {
        let path = manifest.path.clone();
        let Some(config) = &declaration.config else {
            return Vec::new();
        };
        let Some(dependencies) = config.property("dependencies") else {
            return Vec::new();
        };

        let Some(entries) = dependencies.value.as_array() else {
            self.report(Diagnostic::error(
                "The \"dependencies\" field must be an array",
                dependencies.value.location(&path),
            ));
            return Vec::new();
        };

        let mut edges = Vec::new();
        let mut seen = HashSet::new();
        for (i, entry) in entries.iter().enumerate() {
            let location = entry.location(&path);
            let Some(specifier) = entry.as_str() else {
                self.report(Diagnostic::error(
                    format!("dependencies[{i}] must be a string"),
                    location,
                ));
                continue;
            };
            if specifier.trim().is_empty() {
                self.report(Diagnostic::error(
                    format!("dependencies[{i}] must not be empty"),
                    location,
                ));
                continue;
            }

            let target = match self.resolve_specifier(reference, specifier, &location) {
                Some(target) => target,
                None => continue,
            };

            if !seen.insert(target.to_key()) {
                self.report(Diagnostic::error(
                    format!("dependencies[{i}] is a duplicate"),
                    location,
                ));
                continue;
            }

            if let Some(child) = self.analyze_script(&target, stack, Some(&location), root_package)
            {
                if let Some(config) = self.configs[child.0].as_mut() {
                    config.reverse_dependencies.push(id);
                }
                edges.push(Dependency {
                    config: child,
                    specifier_location: location,
                });
            }
        }
        edges
    }

    /// Turn a dependency string into a script reference. Strings with a colon
    /// use the cross-package form `<relative-path>:<script-name>`.
    fn resolve_specifier(
        &mut self,
        reference: &ScriptReference,
        specifier: &str,
        location: &Location,
    ) -> Option<ScriptReference> {
        let Some((raw_path, name)) = specifier.split_once(':') else {
            return Some(ScriptReference::new(
                reference.package_dir.clone(),
                specifier,
            ));
        };

        if raw_path.trim().is_empty() || name.trim().is_empty() {
            self.report(Diagnostic::error(
                "Cross-package dependencies must have the form \
                 \"<relative-path>:<script-name>\"",
                location.clone(),
            ));
            return None;
        }

        let package_dir = normalize_path(&reference.package_dir.join(raw_path));
        if package_dir == reference.package_dir {
            self.report(Diagnostic::error(
                "Cross-package dependencies must lead to a different package",
                location.clone(),
            ));
            return None;
        }

        Some(ScriptReference::new(package_dir, name))
    }

    /// Validate the remaining wireit fields and build the config node.
    fn validate(
        &mut self,
        reference: &ScriptReference,
        manifest: &Arc<PackageJson>,
        mut declaration: Declaration,
        dependencies: Vec<Dependency>,
    ) -> Option<ScriptConfig> {
        let path = manifest.path.clone();

        // Plain script: the scripts entry itself is the command.
        let Some(config) = declaration.config.take() else {
            return Some(ScriptConfig {
                reference: reference.clone(),
                declaration: declaration.config_location,
                kind: ScriptKind::OneShot {
                    command: declaration
                        .surface_command
                        .take()
                        .expect("plain script has a command"),
                    files: None,
                    output: None,
                    clean: CleanPolicy::Always,
                },
                dependencies,
                reverse_dependencies: Vec::new(),
                package_locks: default_package_locks(),
            });
        };

        let mut ok = true;

        let command = match config.property("command") {
            None => None,
            Some(prop) => match prop.value.as_str() {
                Some(command) if !command.trim().is_empty() => Some(command.to_string()),
                _ => {
                    self.report(Diagnostic::error(
                        "The \"command\" field must be a non-empty string",
                        prop.value.location(&path),
                    ));
                    ok = false;
                    None
                }
            },
        };

        let files = self.string_array_field(&config, "files", &path, &mut ok);
        let output = self.string_array_field(&config, "output", &path, &mut ok);

        let clean = match config.property("clean") {
            None => CleanPolicy::Always,
            Some(prop) => match &prop.value.kind {
                JsonKind::Bool(true) => CleanPolicy::Always,
                JsonKind::Bool(false) => CleanPolicy::Never,
                JsonKind::String(s) if s == "if-file-deleted" => CleanPolicy::IfFileDeleted,
                _ => {
                    self.report(Diagnostic::error(
                        "The \"clean\" field must be true, false, or \"if-file-deleted\"",
                        prop.value.location(&path),
                    ));
                    ok = false;
                    CleanPolicy::Always
                }
            },
        };

        let service = match config.property("service") {
            None => false,
            Some(prop) => match prop.value.as_bool() {
                Some(service) => service,
                None => {
                    self.report(Diagnostic::error(
                        "The \"service\" field must be a boolean",
                        prop.value.location(&path),
                    ));
                    ok = false;
                    false
                }
            },
        };

        let package_locks = match self.string_array_field(&config, "packageLocks", &path, &mut ok) {
            None => default_package_locks(),
            Some(locks) => {
                for (i, lock) in locks.iter().enumerate() {
                    if lock.contains('/') || lock.contains('\\') {
                        self.report(Diagnostic::error(
                            format!("packageLocks[{i}] must be a filename, not a path"),
                            config
                                .property("packageLocks")
                                .map(|p| p.value.location(&path))
                                .unwrap_or_else(|| declaration.config_location.clone()),
                        ));
                        ok = false;
                    }
                }
                locks
            }
        };

        if command.is_none() && dependencies.is_empty() {
            self.report(Diagnostic::error(
                format!(
                    "Script \"{}\" must have a command, dependencies, or both",
                    reference.name
                ),
                declaration.config_location.clone(),
            ));
            ok = false;
        }

        if command.is_none() && (files.is_some() || output.is_some()) {
            self.report(Diagnostic::error(
                "A script without a command cannot have \"files\" or \"output\"",
                declaration.config_location.clone(),
            ));
            ok = false;
        }

        if service {
            if command.is_none() {
                self.report(Diagnostic::error(
                    "A service must have a command",
                    declaration.config_location.clone(),
                ));
                ok = false;
            }
            if output.is_some() || config.property("clean").is_some() {
                self.report(Diagnostic::error(
                    "Services are never cached, so they cannot have \"output\" or \"clean\"",
                    declaration.config_location.clone(),
                ));
                ok = false;
            }
        }

        if !ok {
            return None;
        }

        let kind = match (command, service) {
            (Some(command), true) => ScriptKind::Service { command },
            (Some(command), false) => ScriptKind::OneShot {
                command,
                files,
                output,
                clean,
            },
            (None, _) => ScriptKind::NoCommand,
        };

        Some(ScriptConfig {
            reference: reference.clone(),
            declaration: declaration.config_location,
            kind,
            dependencies,
            reverse_dependencies: Vec::new(),
            package_locks,
        })
    }

    /// Shared validation for `files`, `output`, and `packageLocks`: an array
    /// of non-empty strings.
    fn string_array_field(
        &mut self,
        config: &JsonValue,
        field: &str,
        path: &Path,
        ok: &mut bool,
    ) -> Option<Vec<String>> {
        let prop = config.property(field)?;
        let Some(entries) = prop.value.as_array() else {
            self.report(Diagnostic::error(
                format!("The \"{field}\" field must be an array"),
                prop.value.location(path),
            ));
            *ok = false;
            return None;
        };

        let mut out = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            match entry.as_str() {
                Some(s) if !s.trim().is_empty() => out.push(s.to_string()),
                Some(_) => {
                    self.report(Diagnostic::error(
                        format!("{field}[{i}] must not be empty"),
                        entry.location(path),
                    ));
                    *ok = false;
                }
                None => {
                    self.report(Diagnostic::error(
                        format!("{field}[{i}] must be a string"),
                        entry.location(path),
                    ));
                    *ok = false;
                }
            }
        }
        Some(out)
    }
}

/// Intermediate result of locating a script's declaration.
struct Declaration {
    /// The wireit stanza value, when this is a wireit-configured script.
    config: Option<JsonValue>,
    /// Span to attach whole-script diagnostics to.
    config_location: Location,
    /// For plain scripts: the scripts entry itself is the command.
    surface_command: Option<String>,
}

fn default_package_locks() -> Vec<String> {
    vec!["package-lock.json".to_string()]
}

/// Lexically normalize a path: fold `.` and `..` without touching the
/// filesystem, so package directories compare equal regardless of how the
/// dependency spelled them.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Forward-slash relative path from `from` to `to`.
pub fn relative_path(from: &Path, to: &Path) -> String {
    let from: Vec<_> = from.components().collect();
    let to: Vec<_> = to.components().collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<String> = vec!["..".to_string(); from.len() - common];
    parts.extend(
        to[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_manifest(dir: &Path, json: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join("package.json"), json).unwrap();
    }

    fn analyze(dir: &Path, name: &str) -> Result<Analysis, Vec<Diagnostic>> {
        Analyzer::new()
            .analyze(&ScriptReference::new(dir, name))
            .map_err(|(_, diagnostics)| diagnostics)
    }

    #[test]
    fn resolves_simple_graph_with_reverse_edges() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"build": "wireit", "gen": "wireit"},
              "wireit": {
                "build": {"command": "tsc", "dependencies": ["gen"], "files": ["src/**"]},
                "gen": {"command": "codegen", "output": ["gen/"]}
              }
            }"#,
        );

        let analysis = analyze(temp.path(), "build").unwrap();
        assert_eq!(analysis.graph.len(), 2);

        let root = analysis.config(analysis.root);
        assert_eq!(root.reference.name, "build");
        assert_eq!(root.command(), Some("tsc"));
        assert_eq!(root.files(), Some(&["src/**".to_string()][..]));
        assert_eq!(root.dependencies.len(), 1);

        let gen = analysis.config(root.dependencies[0].config);
        assert_eq!(gen.reference.name, "gen");
        assert_eq!(gen.reverse_dependencies, vec![analysis.root]);
        assert_eq!(gen.package_locks, vec!["package-lock.json".to_string()]);
    }

    #[test]
    fn plain_script_dependency_is_a_one_shot_without_files() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit", "b": "echo plain"},
              "wireit": {"a": {"command": "true", "dependencies": ["b"]}}
            }"#,
        );

        let analysis = analyze(temp.path(), "a").unwrap();
        let root = analysis.config(analysis.root);
        let plain = analysis.config(root.dependencies[0].config);
        assert_eq!(plain.command(), Some("echo plain"));
        assert_eq!(plain.files(), None);
        assert!(!plain.is_service());
    }

    #[test]
    fn self_cycle_reports_two_line_trail() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {"command": "true", "dependencies": ["a"]}}
            }"#,
        );

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        let message = &diagnostics[0].message;
        assert!(message.contains("Cycle detected"));
        assert!(message.contains(".-> a\n`-- a"), "got: {message}");
    }

    #[test]
    fn three_cycle_trail_lists_the_path_in_order() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit", "b": "wireit", "c": "wireit"},
              "wireit": {
                "a": {"command": "true", "dependencies": ["b"]},
                "b": {"command": "true", "dependencies": ["c"]},
                "c": {"command": "true", "dependencies": ["a"]}
              }
            }"#,
        );

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(
            diagnostics[0]
                .message
                .contains(".-> a\n|   b\n|   c\n`-- a"),
            "got: {}",
            diagnostics[0].message
        );
    }

    #[test]
    fn missing_dependency_points_at_the_specifier() {
        let temp = TempDir::new().unwrap();
        let source = r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {"command": "true", "dependencies": ["nope"]}}
            }"#;
        write_manifest(temp.path(), source);

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("\"nope\" not found"));
        let offset = source.find("\"nope\"").unwrap();
        assert_eq!(diagnostics[0].location.offset, offset);
    }

    #[test]
    fn script_not_wireit_reports_both_ranges() {
        let temp = TempDir::new().unwrap();
        let source = r#"{
              "scripts": {"b": "not-wireit"},
              "wireit": {"b": {"command": "true"}}
            }"#;
        write_manifest(temp.path(), source);

        let diagnostics = analyze(temp.path(), "b").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        let diagnostic = &diagnostics[0];
        assert_eq!(diagnostic.location.offset, source.find("\"not-wireit\"").unwrap());
        assert_eq!(diagnostic.supplemental.len(), 1);
        assert_eq!(
            diagnostic.supplemental[0].offset,
            source.rfind("\"b\"").unwrap()
        );
    }

    #[test]
    fn field_shape_violations_each_get_one_diagnostic() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {
                "command": "true",
                "dependencies": [42, "  "],
                "files": "src/**",
                "clean": "sometimes",
                "packageLocks": ["sub/package-lock.json"]
              }}
            }"#,
        );

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        let messages: Vec<_> = diagnostics.iter().map(|d| d.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("dependencies[0] must be a string")));
        assert!(messages.iter().any(|m| m.contains("dependencies[1] must not be empty")));
        assert!(messages.iter().any(|m| m.contains("\"files\" field must be an array")));
        assert!(messages.iter().any(|m| m.contains("\"clean\" field must be true, false")));
        assert!(messages.iter().any(|m| m.contains("must be a filename, not a path")));
        assert_eq!(diagnostics.len(), 5);
    }

    #[test]
    fn duplicate_dependency_is_rejected() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit", "b": "wireit"},
              "wireit": {
                "a": {"command": "true", "dependencies": ["b", "b"]},
                "b": {"command": "true"}
              }
            }"#,
        );

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("dependencies[1] is a duplicate"));
    }

    #[test]
    fn cross_package_dependency_resolves_and_labels() {
        let temp = TempDir::new().unwrap();
        let foo = temp.path().join("foo");
        let bar = temp.path().join("bar");
        write_manifest(
            &foo,
            r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {"command": "true", "dependencies": ["../bar:b"]}}
            }"#,
        );
        write_manifest(
            &bar,
            r#"{
              "scripts": {"b": "wireit"},
              "wireit": {"b": {"command": "true"}}
            }"#,
        );

        let analysis = analyze(&foo, "a").unwrap();
        let root = analysis.config(analysis.root);
        let dep = analysis.config(root.dependencies[0].config);
        assert_eq!(dep.reference.package_dir, normalize_path(&bar));
        assert_eq!(analysis.label(root.dependencies[0].config), "../bar:b");
    }

    #[test]
    fn cross_package_dependency_must_leave_the_package() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {"command": "true", "dependencies": [".:a"]}}
            }"#,
        );

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("different package"));
    }

    #[test]
    fn cross_package_cycle_labels_edges_relative_to_root() {
        let temp = TempDir::new().unwrap();
        let foo = temp.path().join("foo");
        let bar = temp.path().join("bar");
        write_manifest(
            &foo,
            r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {"command": "true", "dependencies": ["../bar:b"]}}
            }"#,
        );
        write_manifest(
            &bar,
            r#"{
              "scripts": {"b": "wireit"},
              "wireit": {"b": {"command": "true", "dependencies": ["../foo:a"]}}
            }"#,
        );

        let diagnostics = analyze(&foo, "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        let message = &diagnostics[0].message;
        assert!(message.contains(".-> a\n|   ../bar:b\n`-- a"), "got: {message}");
    }

    #[test]
    fn service_cannot_declare_output() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"serve": "wireit"},
              "wireit": {"serve": {"command": "server", "service": true, "output": ["dist/"]}}
            }"#,
        );

        let diagnostics = analyze(temp.path(), "serve").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("never cached"));
    }

    #[test]
    fn script_needs_command_or_dependencies() {
        let temp = TempDir::new().unwrap();
        write_manifest(
            temp.path(),
            r#"{
              "scripts": {"a": "wireit"},
              "wireit": {"a": {}}
            }"#,
        );

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0]
            .message
            .contains("must have a command, dependencies, or both"));
    }

    #[test]
    fn invalid_json_is_one_file_level_diagnostic() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("package.json"), "{ nope").unwrap();

        let diagnostics = analyze(temp.path(), "a").unwrap_err();
        assert_eq!(diagnostics.len(), 1);
        assert!(diagnostics[0].message.contains("Invalid JSON"));
    }

    #[test]
    fn normalize_and_relative_paths() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(relative_path(Path::new("/a/b"), Path::new("/a/c")), "../c");
        assert_eq!(relative_path(Path::new("/a"), Path::new("/a")), ".");
        assert_eq!(relative_path(Path::new("/a"), Path::new("/a/b/c")), "b/c");
    }
}
