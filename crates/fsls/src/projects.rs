//
// projects.rs
//
// Mapping from source files to the project that owns them, the dependency
// graph between projects, and dependency-order visibility. Project files are
// resolved by an external loader; script files are single-file projects
// whose options come from the compiler.
//

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use indexmap::IndexSet;

/// Compilation context for one project, as produced by the loader (or by the
/// compiler itself for script files).
///
/// Within one project, source order defines intra-project visibility:
/// earlier files are visible to later files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectOptions {
    pub project_file: PathBuf,
    pub source_files: Vec<PathBuf>,
    pub compiler_flags: Vec<String>,
    /// Project files of directly referenced projects
    pub references: Vec<PathBuf>,
}

/// Why a file has no project options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectError {
    NotInWorkspace(PathBuf),
    Loader { file: PathBuf, message: String },
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::NotInWorkspace(path) => {
                write!(f, "no project references {}", path.display())
            }
            ProjectError::Loader { file, message } => {
                write!(f, "failed to load {}: {}", file.display(), message)
            }
        }
    }
}

impl std::error::Error for ProjectError {}

/// Resolves a project file on disk into compilation options.
///
/// Implementations own MSBuild-style resolution and restored-asset parsing;
/// the graph only consumes their results.
pub trait ProjectLoader: Send + Sync {
    fn load(&self, project_file: &Path) -> Result<ProjectOptions, ProjectError>;
}

/// Paths are compared per the host convention: case-insensitively on
/// Windows, case-sensitively elsewhere.
pub fn same_file(a: &Path, b: &Path) -> bool {
    if cfg!(windows) {
        a.to_string_lossy()
            .eq_ignore_ascii_case(&b.to_string_lossy())
    } else {
        a == b
    }
}

fn is_project_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("fsproj")
}

pub fn is_script_file(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("fsx")
}

/// Mutable graph state, guarded by the graph's own lock.
#[derive(Default)]
struct GraphInner {
    /// Loaded projects by project-file path
    projects: HashMap<PathBuf, Arc<ProjectOptions>>,
    /// Script options by script path, resolved on demand by the orchestrator
    scripts: HashMap<PathBuf, Arc<ProjectOptions>>,
    /// Script files discovered in workspace roots
    known_scripts: HashSet<PathBuf>,
    /// Last loader failure per project file
    load_errors: HashMap<PathBuf, String>,
    /// Workspace roots already scanned
    roots: Vec<PathBuf>,
}

/// The project graph.
///
/// Internally synchronized: mutators take the graph's own exclusive lock,
/// and queries hand out `Arc` snapshots under a read lock, so graph updates
/// never serialize against document traffic. Loader and disk I/O happen
/// outside the lock.
pub struct ProjectGraph {
    loader: Arc<dyn ProjectLoader>,
    inner: RwLock<GraphInner>,
    /// Memoized transitive dependency lists, dropped on any mutation
    deps_cache: RwLock<HashMap<PathBuf, Vec<Arc<ProjectOptions>>>>,
}

impl ProjectGraph {
    pub fn new(loader: Arc<dyn ProjectLoader>) -> Self {
        Self {
            loader,
            inner: RwLock::new(GraphInner::default()),
            deps_cache: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GraphInner> {
        self.inner.read().expect("project graph poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, GraphInner> {
        self.inner.write().expect("project graph poisoned")
    }

    /// Scan a workspace root for project and script files. Idempotent.
    pub fn add_workspace_root(&self, dir: &Path) {
        {
            let mut inner = self.write();
            if inner.roots.iter().any(|r| same_file(r, dir)) {
                return;
            }
            inner.roots.push(dir.to_path_buf());
        }

        let mut project_files = Vec::new();
        let mut script_files = Vec::new();
        scan_directory(dir, &mut project_files, &mut script_files);
        log::info!(
            "Workspace root {}: {} project files, {} scripts",
            dir.display(),
            project_files.len(),
            script_files.len()
        );

        for project_file in project_files {
            self.put_project_file(&project_file);
        }
        {
            let mut inner = self.write();
            for script in script_files {
                inner.known_scripts.insert(script);
            }
        }
    }

    /// (Re)load one project or script file after it appeared or changed on
    /// disk. Cached dependency lists are invalidated.
    pub fn put_project_file(&self, path: &Path) {
        if is_script_file(path) {
            // Options are stale; the orchestrator re-resolves on demand
            {
                let mut inner = self.write();
                inner.scripts.remove(path);
                inner.known_scripts.insert(path.to_path_buf());
            }
            self.invalidate();
            return;
        }

        // The loader hits the disk; keep the lock for the map update only
        match self.loader.load(path) {
            Ok(options) => {
                log::info!(
                    "Loaded {} ({} source files)",
                    path.display(),
                    options.source_files.len()
                );
                let mut inner = self.write();
                inner.load_errors.remove(path);
                inner
                    .projects
                    .insert(path.to_path_buf(), Arc::new(options));
            }
            Err(e) => {
                log::warn!("{}", e);
                let mut inner = self.write();
                inner.load_errors.insert(path.to_path_buf(), e.to_string());
                inner.projects.remove(path);
            }
        }
        self.invalidate();
    }

    /// Remove a deleted project or script; files it uniquely contributed are
    /// no longer in the workspace.
    pub fn delete_project_file(&self, path: &Path) {
        {
            let mut inner = self.write();
            inner.projects.remove(path);
            inner.scripts.remove(path);
            inner.known_scripts.remove(path);
            inner.load_errors.remove(path);
        }
        self.invalidate();
    }

    /// Restored assets changed for the project containing this file;
    /// re-consult the loader.
    pub fn update_assets_json(&self, assets_path: &Path) {
        let owner = self
            .read()
            .projects
            .keys()
            .find(|project_file| {
                project_file
                    .parent()
                    .map(|dir| assets_path.starts_with(dir))
                    .unwrap_or(false)
            })
            .cloned();
        if let Some(project_file) = owner {
            log::info!(
                "Assets changed, reloading {}",
                project_file.display()
            );
            self.put_project_file(&project_file);
        }
    }

    /// Record resolved options for a script file.
    pub fn put_script(&self, path: &Path, options: ProjectOptions) {
        {
            let mut inner = self.write();
            inner.known_scripts.insert(path.to_path_buf());
            inner.scripts.insert(path.to_path_buf(), Arc::new(options));
        }
        self.invalidate();
    }

    /// The project that owns a source file.
    pub fn find(&self, file: &Path) -> Result<Arc<ProjectOptions>, ProjectError> {
        let inner = self.read();
        if let Some(options) = inner.scripts.get(file) {
            return Ok(options.clone());
        }
        for options in inner.projects.values() {
            if options.source_files.iter().any(|f| same_file(f, file)) {
                return Ok(options.clone());
            }
        }
        // A failed project in an ancestor directory explains the miss
        for (project_file, message) in &inner.load_errors {
            let owns = project_file
                .parent()
                .map(|dir| file.starts_with(dir))
                .unwrap_or(false);
            if owns {
                return Err(ProjectError::Loader {
                    file: project_file.clone(),
                    message: message.clone(),
                });
            }
        }
        Err(ProjectError::NotInWorkspace(file.to_path_buf()))
    }

    /// Cached script options, if the orchestrator resolved them already.
    pub fn find_script(&self, file: &Path) -> Option<Arc<ProjectOptions>> {
        self.read().scripts.get(file).cloned()
    }

    /// Transitive dependencies in topological order, dependencies before
    /// dependents, the project itself last. Tolerates reference cycles.
    pub fn transitive_deps(&self, options: &ProjectOptions) -> Vec<Arc<ProjectOptions>> {
        if let Some(cached) = self
            .deps_cache
            .read()
            .expect("deps cache poisoned")
            .get(&options.project_file)
        {
            return cached.clone();
        }

        let ordered = {
            let inner = self.read();
            let mut visited = HashSet::new();
            let mut ordered = Vec::new();
            visit_deps(&inner, options, &mut visited, &mut ordered);
            ordered
        };

        self.deps_cache
            .write()
            .expect("deps cache poisoned")
            .insert(options.project_file.clone(), ordered.clone());
        ordered
    }

    /// All source files visible from this project, in dependency order.
    pub fn transitive_source_order(&self, options: &ProjectOptions) -> Vec<PathBuf> {
        let mut ordered = IndexSet::new();
        for project in self.transitive_deps(options) {
            for file in &project.source_files {
                ordered.insert(file.clone());
            }
        }
        ordered.into_iter().collect()
    }

    /// True iff `decl_file` is `from_file` or precedes it in the combined
    /// dependency-ordered source list of `from_file`'s project.
    pub fn visible(&self, decl_file: &Path, from_file: &Path) -> bool {
        if same_file(decl_file, from_file) {
            return true;
        }
        let Ok(options) = self.find(from_file) else {
            return false;
        };
        let ordered = self.transitive_source_order(&options);
        let decl_pos = ordered.iter().position(|f| same_file(f, decl_file));
        let from_pos = ordered.iter().position(|f| same_file(f, from_file));
        match (decl_pos, from_pos) {
            (Some(d), Some(f)) => d < f,
            _ => false,
        }
    }

    /// All loaded projects, plus resolved script projects.
    pub fn open_projects(&self) -> Vec<Arc<ProjectOptions>> {
        let inner = self.read();
        inner
            .projects
            .values()
            .chain(inner.scripts.values())
            .cloned()
            .collect()
    }

    /// Script files discovered in workspace roots, resolved or not.
    pub fn script_files(&self) -> Vec<PathBuf> {
        self.read().known_scripts.iter().cloned().collect()
    }

    fn invalidate(&self) {
        self.deps_cache
            .write()
            .expect("deps cache poisoned")
            .clear();
    }
}

fn visit_deps(
    inner: &GraphInner,
    options: &ProjectOptions,
    visited: &mut HashSet<PathBuf>,
    ordered: &mut Vec<Arc<ProjectOptions>>,
) {
    if !visited.insert(options.project_file.clone()) {
        return;
    }
    for reference in &options.references {
        if let Some(dep) = inner.projects.get(reference) {
            visit_deps(inner, &dep.clone(), visited, ordered);
        }
    }
    let own = inner
        .projects
        .get(&options.project_file)
        .or_else(|| inner.scripts.get(&options.project_file))
        .cloned()
        .unwrap_or_else(|| Arc::new(options.clone()));
    ordered.push(own);
}

fn scan_directory(dir: &Path, projects: &mut Vec<PathBuf>, scripts: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if path.is_dir() {
            // Skip hidden directories and build outputs
            if name.starts_with('.') || name == "obj" || name == "bin" {
                continue;
            }
            scan_directory(&path, projects, scripts);
        } else if is_project_file(&path) {
            projects.push(path);
        } else if is_script_file(&path) {
            scripts.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MapLoader {
        options: HashMap<PathBuf, ProjectOptions>,
    }

    impl ProjectLoader for MapLoader {
        fn load(&self, project_file: &Path) -> Result<ProjectOptions, ProjectError> {
            self.options
                .get(project_file)
                .cloned()
                .ok_or_else(|| ProjectError::Loader {
                    file: project_file.to_path_buf(),
                    message: "unresolvable".to_string(),
                })
        }
    }

    fn project(name: &str, sources: &[&str], references: &[&str]) -> ProjectOptions {
        ProjectOptions {
            project_file: PathBuf::from(name),
            source_files: sources.iter().map(PathBuf::from).collect(),
            compiler_flags: Vec::new(),
            references: references.iter().map(PathBuf::from).collect(),
        }
    }

    fn graph_with(projects: Vec<ProjectOptions>) -> ProjectGraph {
        let options: HashMap<_, _> = projects
            .iter()
            .map(|p| (p.project_file.clone(), p.clone()))
            .collect();
        let graph = ProjectGraph::new(Arc::new(MapLoader { options }));
        for p in projects {
            graph.put_project_file(&p.project_file);
        }
        graph
    }

    #[test]
    fn test_find_source_file() {
        let graph = graph_with(vec![project(
            "/w/a.fsproj",
            &["/w/one.fs", "/w/two.fs"],
            &[],
        )]);

        let options = graph.find(Path::new("/w/one.fs")).unwrap();
        assert_eq!(options.project_file, PathBuf::from("/w/a.fsproj"));

        let err = graph.find(Path::new("/w/elsewhere.fs")).unwrap_err();
        assert_eq!(
            err,
            ProjectError::NotInWorkspace(PathBuf::from("/w/elsewhere.fs"))
        );
    }

    #[test]
    fn test_transitive_deps_topological() {
        let graph = graph_with(vec![
            project("/w/lib.fsproj", &["/w/lib.fs"], &[]),
            project("/w/mid.fsproj", &["/w/mid.fs"], &["/w/lib.fsproj"]),
            project("/w/app.fsproj", &["/w/app.fs"], &["/w/mid.fsproj"]),
        ]);

        let app = graph.find(Path::new("/w/app.fs")).unwrap();
        let deps: Vec<_> = graph
            .transitive_deps(&app)
            .iter()
            .map(|p| p.project_file.clone())
            .collect();
        assert_eq!(
            deps,
            vec![
                PathBuf::from("/w/lib.fsproj"),
                PathBuf::from("/w/mid.fsproj"),
                PathBuf::from("/w/app.fsproj"),
            ]
        );
    }

    #[test]
    fn test_transitive_deps_diamond() {
        let graph = graph_with(vec![
            project("/w/base.fsproj", &["/w/base.fs"], &[]),
            project("/w/left.fsproj", &["/w/left.fs"], &["/w/base.fsproj"]),
            project("/w/right.fsproj", &["/w/right.fs"], &["/w/base.fsproj"]),
            project(
                "/w/top.fsproj",
                &["/w/top.fs"],
                &["/w/left.fsproj", "/w/right.fsproj"],
            ),
        ]);

        let top = graph.find(Path::new("/w/top.fs")).unwrap();
        let deps: Vec<_> = graph
            .transitive_deps(&top)
            .iter()
            .map(|p| p.project_file.clone())
            .collect();
        // Base appears exactly once, before both dependents
        assert_eq!(deps.len(), 4);
        assert_eq!(deps[0], PathBuf::from("/w/base.fsproj"));
        assert_eq!(deps[3], PathBuf::from("/w/top.fsproj"));
    }

    #[test]
    fn test_transitive_deps_cycle_terminates() {
        let graph = graph_with(vec![
            project("/w/a.fsproj", &["/w/a.fs"], &["/w/b.fsproj"]),
            project("/w/b.fsproj", &["/w/b.fs"], &["/w/a.fsproj"]),
        ]);

        let a = graph.find(Path::new("/w/a.fs")).unwrap();
        let deps = graph.transitive_deps(&a);
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_visibility_within_project() {
        let graph = graph_with(vec![project(
            "/w/a.fsproj",
            &["/w/one.fs", "/w/two.fs"],
            &[],
        )]);

        assert!(graph.visible(Path::new("/w/one.fs"), Path::new("/w/two.fs")));
        assert!(!graph.visible(Path::new("/w/two.fs"), Path::new("/w/one.fs")));
        assert!(graph.visible(Path::new("/w/one.fs"), Path::new("/w/one.fs")));
    }

    #[test]
    fn test_visibility_across_projects() {
        let graph = graph_with(vec![
            project("/w/lib.fsproj", &["/w/shared.fs"], &[]),
            project("/w/app.fsproj", &["/w/consumer.fs"], &["/w/lib.fsproj"]),
        ]);

        assert!(graph.visible(Path::new("/w/shared.fs"), Path::new("/w/consumer.fs")));
        assert!(!graph.visible(Path::new("/w/consumer.fs"), Path::new("/w/shared.fs")));
    }

    #[test]
    fn test_delete_project_file() {
        let graph = graph_with(vec![project("/w/a.fsproj", &["/w/one.fs"], &[])]);
        assert!(graph.find(Path::new("/w/one.fs")).is_ok());

        graph.delete_project_file(Path::new("/w/a.fsproj"));
        assert!(graph.find(Path::new("/w/one.fs")).is_err());
    }

    #[test]
    fn test_loader_failure_recorded() {
        let graph = ProjectGraph::new(Arc::new(MapLoader {
            options: HashMap::new(),
        }));
        graph.put_project_file(Path::new("/w/broken.fsproj"));
        assert!(graph.open_projects().is_empty());

        // The loader failure is surfaced for files under the project's directory
        match graph.find(Path::new("/w/orphan.fs")) {
            Err(ProjectError::Loader { file, .. }) => {
                assert_eq!(file, PathBuf::from("/w/broken.fsproj"));
            }
            other => panic!("expected loader error, got {:?}", other),
        }
    }

    #[test]
    fn test_script_options() {
        let graph = ProjectGraph::new(Arc::new(MapLoader {
            options: HashMap::new(),
        }));
        let script = PathBuf::from("/w/play.fsx");
        assert!(graph.find(&script).is_err());

        graph.put_script(
            &script,
            ProjectOptions {
                project_file: script.clone(),
                source_files: vec![script.clone()],
                ..Default::default()
            },
        );
        let options = graph.find(&script).unwrap();
        assert_eq!(options.source_files, vec![script.clone()]);

        // A change on disk drops the cached options
        graph.put_project_file(&script);
        assert!(graph.find_script(&script).is_none());
    }

    #[test]
    fn test_update_assets_json_reloads_owner() {
        let mut options = HashMap::new();
        options.insert(
            PathBuf::from("/w/app/app.fsproj"),
            project("/w/app/app.fsproj", &["/w/app/main.fs"], &[]),
        );
        let graph = ProjectGraph::new(Arc::new(MapLoader { options }));
        graph.put_project_file(Path::new("/w/app/app.fsproj"));

        graph.update_assets_json(Path::new("/w/app/obj/project.assets.json"));
        assert!(graph.find(Path::new("/w/app/main.fs")).is_ok());
    }

    #[test]
    fn test_workspace_root_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let project_file = dir.path().join("a.fsproj");
        std::fs::write(&project_file, "<Project />").unwrap();
        let source = dir.path().join("one.fs");
        std::fs::write(&source, "let x = 1").unwrap();

        let mut options = HashMap::new();
        options.insert(
            project_file.clone(),
            ProjectOptions {
                project_file: project_file.clone(),
                source_files: vec![source.clone()],
                ..Default::default()
            },
        );
        let graph = ProjectGraph::new(Arc::new(MapLoader { options }));

        graph.add_workspace_root(dir.path());
        graph.add_workspace_root(dir.path());
        assert_eq!(graph.open_projects().len(), 1);
        assert!(graph.find(&source).is_ok());
    }

    #[test]
    fn test_queries_run_against_snapshots() {
        // Options handed out before a reload keep their contents
        let graph = graph_with(vec![project("/w/a.fsproj", &["/w/one.fs"], &[])]);
        let before = graph.find(Path::new("/w/one.fs")).unwrap();

        graph.delete_project_file(Path::new("/w/a.fsproj"));

        assert_eq!(before.source_files, vec![PathBuf::from("/w/one.fs")]);
        assert!(graph.find(Path::new("/w/one.fs")).is_err());
    }
}
