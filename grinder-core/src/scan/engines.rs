//! Scan engines backed by external tools
//!
//! | engine            | tool                          | pool    |
//! |-------------------|-------------------------------|---------|
//! | [`NmapEngine`]    | `nmap` port/service scan      | nmap    |
//! | [`VulnersEngine`] | `nmap` + vulners NSE script   | vulners |
//! | [`TlsEngine`]     | TLS-Scanner (`java -jar`)     | nmap    |
//! | [`ScriptEngine`]  | user NSE or Python script     | both    |
//!
//! Output parsing is kept in free functions so it can be tested without the
//! tools installed.

use super::process::CommandRunner;
use super::{EngineRegistry, ScanEngine};
use crate::catalog::{NSE_SCRIPTS_DIR, PY_SCRIPTS_DIR};
use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::types::{
    Port, Protocol, ScanFindings, ScanKind, ScanTask, Service, TlsFindings,
};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

static OPEN_PORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(\d{1,5})/(tcp|udp)[ \t]+(open(?:\|filtered)?)[ \t]+(\S+)(?:[ \t]+(.*?))?[ \t]*\r?$")
        .unwrap_or_else(|e| panic!("invalid open-port pattern: {}", e))
});

/// `<name>   : <verdict>` lines of a TLS-Scanner report
static TLS_VERDICT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^[ \t]*(\S.*?)[ \t]+: (\w+)[ \t]*\r?$")
        .unwrap_or_else(|e| panic!("invalid TLS verdict pattern: {}", e))
});

static CVE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"CVE-\d+-\d+").unwrap_or_else(|e| panic!("invalid CVE pattern: {}", e))
});

const VULNERS_CVE_URL: &str = "https://vulners.com/cve/";

/// Attack names reported by TLS-Scanner
pub const TLS_ATTACKS: &[&str] = &[
    "Padding Oracle",
    "Bleichenbacher",
    "CRIME",
    "Breach",
    "Invalid Curve",
    "Invalid Curve Ephemerals",
    "SSL Poodle",
    "TLS Poodle",
    "CVE-20162107",
    "Logjam",
    "Sweet 32",
    "DROWN",
    "Heartbleed",
    "EarlyCcs",
];

/// Interoperability bugs reported by TLS-Scanner
pub const TLS_BUGS: &[&str] = &[
    "Version Intolerant",
    "Ciphersuite Intolerant",
    "Extension Intolerant",
    "CS Length Intolerant (>512 Byte)",
    "Compression Intolerant",
    "ALPN Intolerant",
    "CH Length Intolerant",
    "NamedGroup Intolerant",
    "Empty last Extension Intolerant",
    "SigHashAlgo Intolerant",
    "Big ClientHello Intolerant",
    "2nd Ciphersuite Byte Bug",
    "Ignores offered Ciphersuites",
    "Reflects offered Ciphersuites",
    "Ignores offered NamedGroups",
    "Ignores offered SigHashAlgos",
];

const TLS_FAILURE_MARKERS: &[&str] = &[
    "Cannot reach the Server",
    "Server does not seem to support SSL",
];

/// Parses open ports from nmap normal output
pub fn parse_open_ports(output: &str) -> Vec<Port> {
    let mut ports: Vec<Port> = OPEN_PORT_RE
        .captures_iter(output)
        .filter_map(|caps| {
            let number: u16 = caps.get(1)?.as_str().parse().ok()?;
            let protocol: Protocol = caps.get(2)?.as_str().parse().ok()?;
            let name = caps.get(4)?.as_str();
            let mut service = Service::new(name);
            if let Some(product) = caps.get(5).map(|m| m.as_str().trim()).filter(|p| !p.is_empty()) {
                service = service.with_product(product);
            }
            Some(Port::with_service(number, protocol, service))
        })
        .collect();
    ports.sort_by_key(|p| (p.number, p.protocol as u8));
    ports.dedup_by_key(|p| (p.number, p.protocol as u8));
    ports
}

/// Extracts CVE ids, mapped to their vulners.com reference
pub fn parse_cves(output: &str) -> BTreeMap<String, String> {
    CVE_RE
        .find_iter(output)
        .map(|m| {
            let id = m.as_str().to_string();
            let url = format!("{}{}", VULNERS_CVE_URL, id);
            (id, url)
        })
        .collect()
}

/// Parses TLS-Scanner output
///
/// Output announcing an unreachable server or missing SSL support is a
/// [`Error::ScanFailure`].
pub fn parse_tls_report(output: &str) -> Result<TlsFindings> {
    if let Some(marker) = TLS_FAILURE_MARKERS.iter().find(|m| output.contains(*m)) {
        return Err(Error::ScanFailure(format!("TLS-Scanner: {}", marker)));
    }

    // First verdict per name wins
    let mut reported: HashMap<&str, bool> = HashMap::new();
    for caps in TLS_VERDICT_RE.captures_iter(output) {
        if let (Some(name), Some(value)) = (caps.get(1), caps.get(2)) {
            reported
                .entry(name.as_str())
                .or_insert(value.as_str() == "true");
        }
    }

    let verdicts = |names: &[&str]| -> BTreeMap<String, bool> {
        names
            .iter()
            .filter_map(|name| Some((name.to_string(), *reported.get(name)?)))
            .collect()
    };

    Ok(TlsFindings {
        attacks: verdicts(TLS_ATTACKS),
        bugs: verdicts(TLS_BUGS),
    })
}

fn target_args(ip: IpAddr, port: u16, udp: bool) -> Vec<OsString> {
    let mut args = Vec::new();
    if ip.is_ipv6() {
        args.push("-6".into());
    }
    if udp {
        args.push("-sU".into());
    }
    args.push("-p".into());
    args.push(port.to_string().into());
    args.push(ip.to_string().into());
    args
}

fn is_udp(task: &ScanTask) -> bool {
    task.context
        .transport
        .as_deref()
        .map_or(false, |t| t.eq_ignore_ascii_case("udp"))
}

/// Port and service scan with nmap
#[derive(Debug, Clone)]
pub struct NmapEngine {
    runner: CommandRunner,
    arguments: Vec<String>,
    host_timeout: Option<Duration>,
}

impl NmapEngine {
    /// Creates an engine running `nmap <arguments>`
    pub fn new(arguments: &str) -> Self {
        Self {
            runner: CommandRunner::new("nmap"),
            arguments: arguments.split_whitespace().map(str::to_string).collect(),
            host_timeout: None,
        }
    }

    /// Passes `--host-timeout` so nmap gives up on its own before the pool does
    pub fn with_host_timeout(mut self, timeout: Duration) -> Self {
        self.host_timeout = Some(timeout);
        self
    }

    fn command_line(&self, task: &ScanTask) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.arguments.iter().map(OsString::from).collect();
        if let Some(timeout) = self.host_timeout {
            args.push("--host-timeout".into());
            args.push(format!("{}s", timeout.as_secs().max(1)).into());
        }
        args.extend(target_args(task.key.ip, task.key.port, is_udp(task)));
        args
    }
}

#[async_trait]
impl ScanEngine for NmapEngine {
    fn name(&self) -> &str {
        "nmap"
    }

    async fn scan(&self, task: &ScanTask) -> Result<ScanFindings> {
        let output = self.runner.run(&self.command_line(task), None).await?;
        Ok(ScanFindings {
            ports: parse_open_ports(&output.stdout),
            vulnerabilities: parse_cves(&output.stdout),
            ..Default::default()
        })
    }
}

/// Vulnerability lookup with nmap and the vulners NSE script
#[derive(Debug, Clone)]
pub struct VulnersEngine {
    runner: CommandRunner,
    script: PathBuf,
}

impl VulnersEngine {
    /// Creates an engine using the vulners script at `script`
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            runner: CommandRunner::new("nmap"),
            script: script.into(),
        }
    }

    fn command_line(&self, task: &ScanTask) -> Vec<OsString> {
        let mut script = OsString::from("--script=");
        script.push(self.script.as_os_str());
        let mut args: Vec<OsString> = vec!["-Pn".into(), "-sV".into(), script];
        args.extend(target_args(task.key.ip, task.key.port, is_udp(task)));
        args
    }
}

#[async_trait]
impl ScanEngine for VulnersEngine {
    fn name(&self) -> &str {
        "vulners"
    }

    async fn scan(&self, task: &ScanTask) -> Result<ScanFindings> {
        let output = self.runner.run(&self.command_line(task), None).await?;
        Ok(ScanFindings {
            ports: parse_open_ports(&output.stdout),
            vulnerabilities: parse_cves(&output.stdout),
            ..Default::default()
        })
    }
}

/// TLS/SSL analysis with TLS-Scanner
#[derive(Debug, Clone)]
pub struct TlsEngine {
    runner: CommandRunner,
    jar: PathBuf,
}

impl TlsEngine {
    /// Creates an engine running the TLS-Scanner jar at `jar`
    pub fn new(jar: impl Into<PathBuf>) -> Self {
        Self {
            runner: CommandRunner::new("java"),
            jar: jar.into(),
        }
    }

    fn command_line(&self, task: &ScanTask) -> Vec<OsString> {
        vec![
            "-jar".into(),
            self.jar.clone().into_os_string(),
            "-connect".into(),
            task.key.to_string().into(),
            "-noColor".into(),
        ]
    }
}

#[async_trait]
impl ScanEngine for TlsEngine {
    fn name(&self) -> &str {
        "tls-scanner"
    }

    async fn scan(&self, task: &ScanTask) -> Result<ScanFindings> {
        let output = self.runner.run(&self.command_line(task), None).await?;
        let tls = parse_tls_report(&output.stdout)?;
        Ok(ScanFindings {
            tls: Some(tls),
            ..Default::default()
        })
    }
}

/// User-provided NSE and Python scripts
///
/// NSE scripts run through nmap against the task's port. Python scripts get
/// the task (address, port and discovery context) as JSON on stdin; their
/// standard output is stored as JSON when it parses, as a string otherwise.
#[derive(Debug, Clone)]
pub struct ScriptEngine {
    nmap: CommandRunner,
    python: CommandRunner,
    scripts_dir: PathBuf,
}

impl ScriptEngine {
    /// Creates an engine resolving scripts under `scripts_dir`
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            nmap: CommandRunner::new("nmap"),
            python: CommandRunner::new("python3"),
            scripts_dir: scripts_dir.into(),
        }
    }

    /// Uses another Python interpreter
    pub fn with_python(mut self, interpreter: impl Into<OsString>) -> Self {
        self.python = CommandRunner::new(interpreter);
        self
    }

    fn script_path(&self, task: &ScanTask) -> Result<PathBuf> {
        let name = task.script.as_deref().ok_or_else(|| {
            Error::ScanFailure(format!("{} task without script name", task.kind))
        })?;
        let subdir = match task.kind {
            ScanKind::NseScript => NSE_SCRIPTS_DIR,
            ScanKind::PythonScript => PY_SCRIPTS_DIR,
            other => {
                return Err(Error::ScanFailure(format!(
                    "script engine cannot run {} tasks",
                    other
                )))
            }
        };
        Ok(self.scripts_dir.join(subdir).join(name))
    }
}

/// Parses script output as JSON, falling back to the trimmed text
pub fn parse_script_output(stdout: &str) -> Option<serde_json::Value> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string())),
    )
}

#[async_trait]
impl ScanEngine for ScriptEngine {
    fn name(&self) -> &str {
        "script"
    }

    async fn scan(&self, task: &ScanTask) -> Result<ScanFindings> {
        let path = self.script_path(task)?;
        match task.kind {
            ScanKind::NseScript => {
                let mut script = OsString::from("--script=");
                script.push(path.as_os_str());
                let mut args: Vec<OsString> = vec!["-Pn".into(), script];
                args.extend(target_args(task.key.ip, task.key.port, is_udp(task)));
                let output = self.nmap.run(&args, None).await?;
                Ok(ScanFindings {
                    ports: parse_open_ports(&output.stdout),
                    vulnerabilities: parse_cves(&output.stdout),
                    script_output: parse_script_output(&output.stdout),
                    ..Default::default()
                })
            }
            _ => {
                let input = serde_json::to_vec(&serde_json::json!({
                    "ip": task.key.ip,
                    "port": task.key.port,
                    "vendor": task.context.vendor,
                    "product": task.context.product,
                    "transport": task.context.transport,
                    "country": task.context.country,
                }))?;
                let output = self.python.run(&[path.into_os_string()], Some(&input)).await?;
                Ok(ScanFindings {
                    script_output: parse_script_output(&output.stdout),
                    ..Default::default()
                })
            }
        }
    }
}

/// Engines backed by the real tools, configured from `config`
pub fn production_registry(config: &RunConfig) -> EngineRegistry {
    let scripts: Arc<dyn ScanEngine> = Arc::new(ScriptEngine::new(&config.scripts_dir));
    EngineRegistry::new()
        .with(
            ScanKind::PortService,
            Arc::new(NmapEngine::new(&config.nmap_arguments).with_host_timeout(config.nmap_timeout)),
        )
        .with(
            ScanKind::Vulnerability,
            Arc::new(VulnersEngine::new(&config.vulners_script)),
        )
        .with(ScanKind::Tls, Arc::new(TlsEngine::new(&config.tls_scanner_jar)))
        .with(ScanKind::NseScript, Arc::clone(&scripts))
        .with(ScanKind::PythonScript, scripts)
}
