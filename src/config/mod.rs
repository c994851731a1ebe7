use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::LevelFilter;
use serde::Deserialize;

/// A command to run, either as an application or as a checker.
#[derive(Debug, Clone)]
pub struct CommandConfig {
    pub file: String,
    pub args: Vec<String>,
    /// `KEY=VALUE` overrides applied on top of the inherited parent environment.
    pub env: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: Option<String>,
    pub command: CommandConfig,
    pub checker: Option<CommandConfig>,
    pub max_start_time_ms: u64,
    pub preamble: Vec<Arc<AppConfig>>,
    pub tags: Vec<String>,
}

impl AppConfig {
    /// Stable identity for supervisor bookkeeping: the address this config
    /// lives at, not its name. Two configs sharing a name are still distinct
    /// if they were not resolved to the same `Arc`.
    pub fn identity(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub app: Option<Arc<AppConfig>>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: u16,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub listen: u16,
}

#[derive(Debug, Clone)]
pub struct LoggerConfig {
    pub file: Option<PathBuf>,
    pub level: LevelFilter,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin: AdminConfig,
    pub logger: LoggerConfig,
    pub proxies: Vec<ProxyConfig>,
}

const DEFAULT_ADMIN_PORT: u16 = 19500;
const DEFAULT_CHECKER_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_FILE: &str = "nexer.log";

impl Config {
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse_str(&text)
    }

    pub fn parse_str(text: &str) -> Result<Config> {
        let raw: RawConfig =
            json5::from_str(text).with_context(|| "parsing config as JSON5")?;
        resolve(raw)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields = false)]
struct RawConfig {
    admin: Option<RawAdmin>,
    logger: Option<RawLogger>,
    #[serde(default)]
    apps: Vec<RawApp>,
    #[serde(default)]
    proxies: Vec<RawProxy>,
}

#[derive(Debug, Deserialize)]
struct RawAdmin {
    listen: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawLogger {
    file: Option<String>,
    level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct RawCommand {
    file: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Vec<String>,
    cwd: Option<String>,
    #[serde(default)]
    timeout: u64,
}

#[derive(Debug, Deserialize, Clone)]
struct RawApp {
    name: Option<String>,
    command: RawCommand,
    checker: Option<RawCommand>,
    #[serde(default)]
    max_start_time: u64,
    #[serde(default)]
    preamble: Vec<RawAppRef>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum RawAppRef {
    Name(String),
    Inline(Box<RawApp>),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum RawAppOrName {
    Name(String),
    Inline(Box<RawApp>),
}

#[derive(Debug, Deserialize)]
struct RawUpstream {
    host: String,
    port: u16,
    #[serde(default)]
    connect_timeout: Option<u64>,
    app: Option<RawAppOrName>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawProxy {
    listen: u16,
    upstream: RawUpstream,
}

/// Resolves a parsed raw config into the typed graph, deduplicating named
/// apps by name so that two references to the same name share one identity
/// (and therefore one `SupervisedApp`), while inline/anonymous app blocks
/// always get a fresh identity.
struct Resolver {
    named: HashMap<String, Arc<AppConfig>>,
}

impl Resolver {
    fn new() -> Self {
        Self {
            named: HashMap::new(),
        }
    }

    fn resolve_named(&mut self, named_apps: &[RawApp]) -> Result<()> {
        for raw in named_apps {
            let Some(name) = raw.name.clone() else {
                continue;
            };
            if self.named.contains_key(&name) {
                continue;
            }
            let resolved = self.resolve_app(raw.clone())?;
            self.named.insert(name, resolved);
        }
        Ok(())
    }

    fn resolve_app(&mut self, raw: RawApp) -> Result<Arc<AppConfig>> {
        let mut preamble = Vec::with_capacity(raw.preamble.len());
        for p in raw.preamble {
            preamble.push(self.resolve_app_ref(p)?);
        }
        Ok(Arc::new(AppConfig {
            name: raw.name,
            command: resolve_command(raw.command),
            checker: raw.checker.map(|c| {
                let mut cmd = resolve_command(c);
                if cmd.timeout_ms == 0 {
                    cmd.timeout_ms = DEFAULT_CHECKER_TIMEOUT_MS;
                }
                cmd
            }),
            max_start_time_ms: raw.max_start_time,
            preamble,
            tags: raw.tags,
        }))
    }

    fn resolve_app_ref(&mut self, r: RawAppRef) -> Result<Arc<AppConfig>> {
        match r {
            RawAppRef::Name(name) => self
                .named
                .get(&name)
                .cloned()
                .with_context(|| format!("preamble references unknown app \"{name}\"")),
            RawAppRef::Inline(app) => self.resolve_app(*app),
        }
    }

    fn resolve_app_or_name(&mut self, r: RawAppOrName) -> Result<Arc<AppConfig>> {
        match r {
            RawAppOrName::Name(name) => self
                .named
                .get(&name)
                .cloned()
                .with_context(|| format!("upstream references unknown app \"{name}\"")),
            RawAppOrName::Inline(app) => self.resolve_app(*app),
        }
    }
}

fn resolve_command(raw: RawCommand) -> CommandConfig {
    CommandConfig {
        file: raw.file,
        args: raw.args,
        env: raw.env,
        cwd: raw.cwd.map(PathBuf::from),
        timeout_ms: raw.timeout,
    }
}

fn resolve(raw: RawConfig) -> Result<Config> {
    let mut resolver = Resolver::new();
    resolver.resolve_named(&raw.apps)?;

    let admin = AdminConfig {
        listen: raw.admin.and_then(|a| a.listen).unwrap_or(DEFAULT_ADMIN_PORT),
    };

    let logger = match raw.logger {
        Some(l) => LoggerConfig {
            file: Some(PathBuf::from(l.file.unwrap_or_else(|| DEFAULT_LOG_FILE.to_string()))),
            level: l
                .level
                .map(|s| parse_level(&s))
                .transpose()?
                .unwrap_or(LevelFilter::Info),
        },
        None => LoggerConfig {
            file: Some(PathBuf::from(DEFAULT_LOG_FILE)),
            level: LevelFilter::Info,
        },
    };

    let mut proxies = Vec::with_capacity(raw.proxies.len());
    for p in raw.proxies {
        let app = p
            .upstream
            .app
            .map(|a| resolver.resolve_app_or_name(a))
            .transpose()?;
        proxies.push(ProxyConfig {
            listen: p.listen,
            upstream: UpstreamConfig {
                host: p.upstream.host,
                port: p.upstream.port,
                connect_timeout_ms: p.upstream.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
                app,
                tags: p.upstream.tags,
            },
        });
    }

    Ok(Config {
        admin,
        logger,
        proxies,
    })
}

fn parse_level(s: &str) -> Result<LevelFilter> {
    match s.to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LevelFilter::Trace),
        "DEBUG" => Ok(LevelFilter::Debug),
        "INFO" => Ok(LevelFilter::Info),
        "WARN" | "WARNING" => Ok(LevelFilter::Warn),
        "ERROR" | "FATAL" | "CRITICAL" => Ok(LevelFilter::Error),
        other => bail!("unknown log level \"{other}\""),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::parse_str(
            r#"{
                proxies: [
                    { listen: 8080, upstream: { host: "127.0.0.1", port: 9090 } },
                ],
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.admin.listen, DEFAULT_ADMIN_PORT);
        assert_eq!(cfg.proxies.len(), 1);
        assert_eq!(cfg.proxies[0].upstream.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
    }

    #[test]
    fn named_apps_share_identity_across_references() {
        let cfg = Config::parse_str(
            r#"{
                apps: [
                    { name: "db", command: { file: "/bin/db" } },
                ],
                proxies: [
                    { listen: 1, upstream: { host: "h", port: 1, app: "db" } },
                    { listen: 2, upstream: { host: "h", port: 2, app: "db" } },
                ],
            }"#,
        )
        .unwrap();

        let a = cfg.proxies[0].upstream.app.clone().unwrap();
        let b = cfg.proxies[1].upstream.app.clone().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn checker_gets_default_timeout() {
        let cfg = Config::parse_str(
            r#"{
                apps: [
                    { name: "a", command: { file: "/bin/a" }, checker: { file: "/bin/check" } },
                ],
                proxies: [
                    { listen: 1, upstream: { host: "h", port: 1, app: "a" } },
                ],
            }"#,
        )
        .unwrap();
        let app = cfg.proxies[0].upstream.app.clone().unwrap();
        assert_eq!(app.checker.as_ref().unwrap().timeout_ms, DEFAULT_CHECKER_TIMEOUT_MS);
    }
}
