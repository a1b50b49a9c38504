//! App definition files
//!
//! Every entry in the config directory defines one app, named after the file:
//!
//! - `<name>.toml` - full definition (command or `[services.*]`)
//! - `<name>` holding an absolute or `~` path to a directory - static site
//! - `<name>` holding anything else - shell command run from the home dir
//! - `<name>` as a directory or a symlink to one - static site

use crate::error::{ConfigError, ConfigResult};
use crate::instances::ServiceSpec;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon settings file, not an app
pub const SETTINGS_FILE: &str = "config.toml";
/// Persisted dashboard theme, not an app
pub const THEME_FILE: &str = "theme";

/// One loaded app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDefinition {
    pub name: String,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub hidden: bool,
    pub idle_timeout: Option<Duration>,
    /// File the definition was read from
    pub source: PathBuf,
    pub layout: AppLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppLayout {
    /// Files served from a directory; no process
    Static { root: PathBuf },
    /// Something already listening on a port; no process
    Port(u16),
    /// One command
    Single(ServiceSpec),
    /// Several services, in dependency order
    Services(Vec<ServiceDefinition>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    pub name: String,
    pub default: bool,
    pub depends_on: Vec<String>,
    pub spec: ServiceSpec,
}

impl AppDefinition {
    /// Static sites and port apps have nothing to start or stop.
    pub fn is_supervised(&self) -> bool {
        matches!(self.layout, AppLayout::Single(_) | AppLayout::Services(_))
    }

    /// Directory a terminal or editor should open in
    pub fn working_dir(&self) -> PathBuf {
        match &self.layout {
            AppLayout::Static { root } => root.clone(),
            AppLayout::Port(_) => home_dir(),
            AppLayout::Single(spec) => spec.dir.clone(),
            AppLayout::Services(services) => services
                .iter()
                .find(|s| s.default)
                .or_else(|| services.first())
                .map(|s| s.spec.dir.clone())
                .unwrap_or_else(home_dir),
        }
    }

    /// Whether switching from `self` to `other` requires a restart
    pub fn needs_restart(&self, other: &AppDefinition) -> bool {
        self.layout != other.layout
    }
}

/// Service address used in hostnames, process keys and the API:
/// `<slug(service)>-<app>`
pub fn service_address(app: &str, service: &str) -> String {
    format!("{}-{app}", slugify(service))
}

/// Lowercase, with runs of non-alphanumerics collapsed to `-`
pub fn slugify(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut dash = false;
    for c in value.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

/// Expand a leading `~`, and resolve relative paths against `base`.
pub fn expand_path(raw: &str, base: &Path) -> PathBuf {
    let raw = raw.trim();
    let path = if raw == "~" {
        home_dir()
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(raw)
    };
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Entries in the config directory that never define apps
pub fn is_ignored(file_name: &str) -> bool {
    file_name.starts_with('.')
        || file_name == SETTINGS_FILE
        || file_name == THEME_FILE
        || file_name.starts_with("config-")
        || file_name.ends_with('~')
        || file_name.ends_with(".swp")
}

/// Load every app in `dir`, sorted by file name. Broken entries are logged
/// and skipped so one typo doesn't take every app down.
pub fn load_dir(dir: &Path) -> Vec<AppDefinition> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "Config directory does not exist yet");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Failed to read config directory");
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    paths.sort();

    let mut apps: Vec<AppDefinition> = Vec::new();
    let mut names = HashSet::new();
    for path in paths {
        match load_entry(&path) {
            Ok(Some(app)) => {
                if !names.insert(app.name.clone()) {
                    tracing::warn!(app = %app.name, path = %path.display(), "Duplicate app name, skipping");
                    continue;
                }
                apps.push(app);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Skipping app: {}", e),
        }
    }
    drop_address_clashes(apps)
}

/// Service addresses (`<service>-<app>`) share one namespace with app names
/// and aliases. A multi-service app whose address would shadow another app
/// is skipped.
fn drop_address_clashes(apps: Vec<AppDefinition>) -> Vec<AppDefinition> {
    let taken: HashSet<&str> = apps
        .iter()
        .flat_map(|app| std::iter::once(app.name.as_str()).chain(app.aliases.iter().map(String::as_str)))
        .collect();

    let clashing: HashSet<String> = apps
        .iter()
        .filter_map(|app| {
            let AppLayout::Services(services) = &app.layout else {
                return None;
            };
            let clash = services
                .iter()
                .map(|s| service_address(&app.name, &s.name))
                .find(|address| taken.contains(address.as_str()))?;
            tracing::warn!(
                app = %app.name,
                address = %clash,
                "Service address collides with another app, skipping"
            );
            Some(app.name.clone())
        })
        .collect();

    apps.into_iter()
        .filter(|app| !clashing.contains(&app.name))
        .collect()
}

/// Load one directory entry. `Ok(None)` for entries that aren't apps.
pub fn load_entry(path: &Path) -> ConfigResult<Option<AppDefinition>> {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    if is_ignored(file_name) {
        return Ok(None);
    }

    // Directories and symlinks to directories are static sites.
    if path.is_dir() {
        let root = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        return Ok(Some(static_app(file_name, path, root)));
    }

    if let Some(name) = file_name.strip_suffix(".toml") {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        return parse_app_toml(name, &content, path).map(Some);
    }

    let content =
        fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    parse_plain(file_name, &content, path).map(Some)
}

fn static_app(name: &str, source: &Path, root: PathBuf) -> AppDefinition {
    AppDefinition {
        name: name.to_string(),
        description: None,
        aliases: Vec::new(),
        hidden: false,
        idle_timeout: None,
        source: source.to_path_buf(),
        layout: AppLayout::Static { root },
    }
}

/// Plain file: a port number, a directory path (static site) or a shell
/// command.
pub fn parse_plain(name: &str, content: &str, source: &Path) -> ConfigResult<AppDefinition> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ConfigError::Validation(
            source.to_path_buf(),
            "file is empty".to_string(),
        ));
    }

    if let Ok(port) = content.parse::<u16>()
        && port > 0
    {
        return Ok(AppDefinition {
            name: name.to_string(),
            description: None,
            aliases: Vec::new(),
            hidden: false,
            idle_timeout: None,
            source: source.to_path_buf(),
            layout: AppLayout::Port(port),
        });
    }

    let single_line = !content.contains('\n');
    if single_line && (content.starts_with('/') || content.starts_with('~')) {
        let root = expand_path(content, &home_dir());
        if root.is_dir() {
            return Ok(static_app(name, source, root));
        }
    }

    Ok(AppDefinition {
        name: name.to_string(),
        description: None,
        aliases: Vec::new(),
        hidden: false,
        idle_timeout: None,
        source: source.to_path_buf(),
        layout: AppLayout::Single(ServiceSpec {
            command: content.to_string(),
            dir: home_dir(),
            ..Default::default()
        }),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AppFile {
    name: Option<String>,
    description: Option<String>,
    aliases: Vec<String>,
    alias: Option<String>,
    root: Option<String>,
    cmd: Option<String>,
    env: BTreeMap<String, String>,
    port: Option<u16>,
    ready_pattern: Option<String>,
    idle_timeout_secs: Option<u64>,
    hidden: bool,
    services: BTreeMap<String, ServiceFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServiceFile {
    dir: Option<String>,
    cmd: Option<String>,
    env: BTreeMap<String, String>,
    port: Option<u16>,
    default: bool,
    depends_on: Vec<String>,
    ready_pattern: Option<String>,
}

/// Parse a `<name>.toml` app definition.
pub fn parse_app_toml(file_stem: &str, content: &str, source: &Path) -> ConfigResult<AppDefinition> {
    let file: AppFile =
        toml::from_str(content).map_err(|e| ConfigError::TomlParse(source.to_path_buf(), e))?;
    let invalid = |msg: String| ConfigError::Validation(source.to_path_buf(), msg);

    let name = file
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(file_stem)
        .to_string();
    if name.contains(char::is_whitespace) || name.contains('/') {
        return Err(invalid(format!("invalid app name '{name}'")));
    }

    let config_dir = source.parent().unwrap_or(Path::new("/"));
    let root = file
        .root
        .as_deref()
        .map(|r| expand_path(r, config_dir))
        .unwrap_or_else(home_dir);

    let mut aliases: Vec<String> = file
        .aliases
        .into_iter()
        .chain(file.alias)
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty() && *a != name)
        .collect();
    aliases.sort();
    aliases.dedup();

    let command = file.cmd.map(|c| c.trim().to_string()).filter(|c| !c.is_empty());
    let layout = match (command, file.services.is_empty()) {
        (Some(_), false) => {
            return Err(invalid(
                "define either `cmd` or `[services]`, not both".to_string(),
            ));
        }
        (Some(command), true) => AppLayout::Single(ServiceSpec {
            command,
            dir: root.clone(),
            env: file.env,
            port: file.port,
            ready_pattern: file.ready_pattern,
        }),
        (None, true) => {
            return Err(invalid("missing `cmd` or `[services]`".to_string()));
        }
        (None, false) => {
            let services = parse_services(file.services, &root, &file.env, &invalid)?;
            if services.len() == 1 {
                let mut only = services;
                AppLayout::Single(only.remove(0).spec)
            } else {
                AppLayout::Services(services)
            }
        }
    };

    Ok(AppDefinition {
        name,
        description: file.description.filter(|d| !d.trim().is_empty()),
        aliases,
        hidden: file.hidden,
        idle_timeout: file
            .idle_timeout_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs),
        source: source.to_path_buf(),
        layout,
    })
}

fn parse_services(
    raw: BTreeMap<String, ServiceFile>,
    root: &Path,
    shared_env: &BTreeMap<String, String>,
    invalid: &dyn Fn(String) -> ConfigError,
) -> ConfigResult<Vec<ServiceDefinition>> {
    let mut services = Vec::with_capacity(raw.len());
    for (name, service) in raw {
        if slugify(&name).is_empty() {
            return Err(invalid(format!("invalid service name '{name}'")));
        }
        let Some(command) = service.cmd.map(|c| c.trim().to_string()).filter(|c| !c.is_empty())
        else {
            return Err(invalid(format!("service '{name}' is missing `cmd`")));
        };
        let dir = service
            .dir
            .as_deref()
            .map(|d| expand_path(d, root))
            .unwrap_or_else(|| root.to_path_buf());
        let mut env = shared_env.clone();
        env.extend(service.env);

        services.push(ServiceDefinition {
            name,
            default: service.default,
            depends_on: service.depends_on,
            spec: ServiceSpec {
                command,
                dir,
                env,
                port: service.port,
                ready_pattern: service.ready_pattern,
            },
        });
    }

    let known: HashSet<String> = services.iter().map(|s| s.name.clone()).collect();
    for service in &mut services {
        service.depends_on.retain(|dep| {
            let ok = known.contains(dep) && *dep != service.name;
            if !ok {
                tracing::warn!(service = %service.name, dependency = %dep, "Ignoring unknown dependency");
            }
            ok
        });
    }

    // At most one default; the first marked one wins.
    let mut seen_default = false;
    for service in &mut services {
        if service.default {
            service.default = !seen_default;
            seen_default = true;
        }
    }

    Ok(topo_sort(services))
}

/// Order services so dependencies come first. Services stuck in a cycle keep
/// their original (alphabetical) order at the end.
pub fn topo_sort(services: Vec<ServiceDefinition>) -> Vec<ServiceDefinition> {
    let index: HashMap<&str, usize> = services
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();

    let mut indegree = vec![0usize; services.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
    for (i, service) in services.iter().enumerate() {
        for dep in &service.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..services.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(services.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &next in &dependents[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() < services.len() {
        let cyclic: Vec<&str> = (0..services.len())
            .filter(|i| !order.contains(i))
            .map(|i| services[i].name.as_str())
            .collect();
        tracing::warn!(services = ?cyclic, "Dependency cycle detected");
        order.extend((0..services.len()).filter(|i| indegree[*i] > 0));
    }

    let mut slots: Vec<Option<ServiceDefinition>> = services.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(content: &str) -> ConfigResult<AppDefinition> {
        parse_app_toml("shop", content, Path::new("/tmp/perch/shop.toml"))
    }

    fn service_names(app: &AppDefinition) -> Vec<&str> {
        match &app.layout {
            AppLayout::Services(s) => s.iter().map(|s| s.name.as_str()).collect(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn single_command_app() {
        let app = parse(
            r#"
description = "The shop"
alias = "store"
root = "/srv/shop"
cmd = "npm run dev"
port = 4000
idle_timeout_secs = 600

[env]
API = "http://localhost:$PORT"
"#,
        )
        .unwrap();

        assert_eq!(app.name, "shop");
        assert_eq!(app.description.as_deref(), Some("The shop"));
        assert_eq!(app.aliases, vec!["store"]);
        assert_eq!(app.idle_timeout, Some(Duration::from_secs(600)));
        let AppLayout::Single(spec) = &app.layout else {
            panic!("expected single layout");
        };
        assert_eq!(spec.command, "npm run dev");
        assert_eq!(spec.dir, PathBuf::from("/srv/shop"));
        assert_eq!(spec.port, Some(4000));
        assert_eq!(spec.env["API"], "http://localhost:$PORT");
    }

    #[test]
    fn services_are_sorted_by_dependency() {
        let app = parse(
            r#"
root = "/srv/shop"

[services.web]
cmd = "npm run web"
default = true
depends_on = ["api"]

[services.api]
cmd = "cargo run"
dir = "backend"
depends_on = ["db"]

[services.db]
cmd = "postgres -D data"
dir = "/var/db"
"#,
        )
        .unwrap();

        assert_eq!(service_names(&app), vec!["db", "api", "web"]);
        let AppLayout::Services(services) = &app.layout else {
            unreachable!()
        };
        assert_eq!(services[1].spec.dir, PathBuf::from("/srv/shop/backend"));
        assert_eq!(services[0].spec.dir, PathBuf::from("/var/db"));
        assert!(services[2].default);
    }

    #[test]
    fn single_service_table_collapses_to_one_app() {
        let app = parse(
            r#"
[services.web]
cmd = "npm start"
"#,
        )
        .unwrap();
        assert!(matches!(app.layout, AppLayout::Single(ref s) if s.command == "npm start"));
    }

    #[test]
    fn cycle_keeps_every_service() {
        let app = parse(
            r#"
[services.a]
cmd = "a"
depends_on = ["b"]

[services.b]
cmd = "b"
depends_on = ["a"]

[services.c]
cmd = "c"
"#,
        )
        .unwrap();
        assert_eq!(service_names(&app), vec!["c", "a", "b"]);
    }

    #[test]
    fn unknown_dependencies_are_dropped() {
        let app = parse(
            r#"
[services.a]
cmd = "a"
depends_on = ["ghost", "a"]

[services.b]
cmd = "b"
"#,
        )
        .unwrap();
        let AppLayout::Services(services) = &app.layout else {
            unreachable!()
        };
        assert!(services.iter().all(|s| s.depends_on.is_empty()));
    }

    #[test]
    fn rejects_missing_command() {
        assert!(matches!(
            parse("description = \"nothing\""),
            Err(ConfigError::Validation(..))
        ));
        assert!(matches!(
            parse("[services.a]\ndir = \"x\"\n[services.b]\ncmd = \"b\""),
            Err(ConfigError::Validation(..))
        ));
    }

    #[test]
    fn rejects_cmd_and_services_together() {
        assert!(parse("cmd = \"x\"\n[services.a]\ncmd = \"a\"").is_err());
    }

    #[test]
    fn rejects_bad_toml() {
        assert!(matches!(parse("cmd = "), Err(ConfigError::TomlParse(..))));
    }

    #[test]
    fn service_address_slugs_service_name() {
        assert_eq!(service_address("shop", "API Server"), "api-server-shop");
        assert_eq!(slugify("--Web__UI--"), "web-ui");
    }

    #[test]
    fn load_dir_reads_every_kind_and_skips_ignored() {
        let dir = TempDir::new().unwrap();
        let site = TempDir::new().unwrap();
        fs::write(dir.path().join("api"), "bin/server --dev\n").unwrap();
        fs::write(
            dir.path().join("docs"),
            format!("{}\n", site.path().display()),
        )
        .unwrap();
        fs::write(dir.path().join("shop.toml"), "cmd = \"npm start\"\n").unwrap();
        fs::write(dir.path().join("config.toml"), "tld = \"test\"\n").unwrap();
        fs::write(dir.path().join("theme"), "dark\n").unwrap();
        fs::write(dir.path().join(".hidden"), "x").unwrap();
        fs::write(dir.path().join("broken.toml"), "cmd = ").unwrap();

        let apps = load_dir(dir.path());
        let names: Vec<&str> = apps.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["api", "docs", "shop"]);
        assert!(matches!(apps[0].layout, AppLayout::Single(ref s) if s.command == "bin/server --dev"));
        assert!(matches!(apps[1].layout, AppLayout::Static { .. }));
    }

    #[test]
    fn port_number_file_is_a_port_app() {
        let app = parse_plain("api", "3000\n", Path::new("/cfg/api")).unwrap();
        assert_eq!(app.layout, AppLayout::Port(3000));
        assert!(!app.is_supervised());

        // out of range or zero falls through to a command
        let app = parse_plain("odd", "70000", Path::new("/cfg/odd")).unwrap();
        assert!(matches!(app.layout, AppLayout::Single(ref s) if s.command == "70000"));
        let app = parse_plain("zero", "0", Path::new("/cfg/zero")).unwrap();
        assert!(matches!(app.layout, AppLayout::Single(_)));
    }

    #[test]
    fn app_shadowed_by_service_address_is_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("web-shop"), "echo single\n").unwrap();
        fs::write(
            dir.path().join("shop.toml"),
            "[services.web]\ncmd = \"a\"\n[services.api]\ncmd = \"b\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("blog.toml"),
            "[services.web]\ncmd = \"a\"\n[services.db]\ncmd = \"b\"\n",
        )
        .unwrap();

        let names: Vec<String> = load_dir(dir.path()).into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["blog", "web-shop"]);
    }

    #[test]
    fn missing_dir_loads_nothing() {
        assert!(load_dir(Path::new("/no/such/perch/dir")).is_empty());
    }

    #[test]
    fn layout_change_needs_restart_but_description_does_not() {
        let a = parse("cmd = \"one\"").unwrap();
        let mut b = a.clone();
        b.description = Some("new".to_string());
        assert!(!a.needs_restart(&b));
        let c = parse("cmd = \"two\"").unwrap();
        assert!(a.needs_restart(&c));
    }
}
