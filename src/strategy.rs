//! Strategy file compilation.
//!
//! A strategy is a line-oriented text file of `--filter-<proto>=<ports>`
//! directives followed by worker arguments. Compilation is a pure step: each
//! directive becomes one `(FilterRule, WorkerSpec)` pair sharing a queue
//! number, dense from 0. The firewall reconciler reifies the rules and the
//! worker supervisor spawns one process per spec; the shared queue number is
//! the only link between the two sides.

use anyhow::Result;
use regex::Regex;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::error::ZapretError;

/// Ports substituted for `%GameFilter%` when the game filter is enabled.
pub const GAME_FILTER_PORTS: &str = "1024-65535";

const BIN_PLACEHOLDER: &str = "%BIN%";
const LISTS_PLACEHOLDER: &str = "%LISTS%";
const GAME_FILTER_PLACEHOLDER: &str = "%GameFilter%";

/// Transport protocol a filter rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One kernel-side filter rule steering matching flows into a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub protocol: Protocol,
    /// Comma-separated singletons and inclusive `lo-hi` ranges.
    pub ports: String,
    pub queue_num: u16,
    /// Let packets pass when no worker is reading the queue.
    pub bypass_on_stall: bool,
}

/// Arguments for the worker bound to one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub queue_num: u16,
    pub args: Vec<String>,
}

/// The compiled strategy: parallel rule/worker sequences with pairwise equal
/// queue numbers (`rules[i].queue_num == workers[i].queue_num == i`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledStrategy {
    pub rules: Vec<FilterRule>,
    pub workers: Vec<WorkerSpec>,
}

impl CompiledStrategy {
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn directive_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--filter-(tcp|udp)=([0-9,\-]+)").expect("directive regex"))
}

/// Compile a strategy file.
///
/// A file with zero directives compiles to an empty strategy (the session
/// will start but do nothing); that is a warning, not an error.
pub fn compile(path: &Path, gamefilter: bool) -> Result<CompiledStrategy> {
    debug!(file = %path.display(), gamefilter, "parsing strategy file");

    let file = std::fs::File::open(path).map_err(|e| ZapretError::StrategyParse {
        file: path.to_path_buf(),
        line: 0,
        message: format!("failed to open file: {e}"),
    })?;

    let mut strategy = CompiledStrategy::default();
    let mut queue_num: u16 = 0;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line_num = idx + 1;
        let line = line.map_err(|e| ZapretError::StrategyParse {
            file: path.to_path_buf(),
            line: line_num,
            message: format!("read error: {e}"),
        })?;
        let line = line.trim_end_matches('\r');

        if is_ignored(line) {
            continue;
        }

        let processed = apply_placeholders(line, gamefilter);

        for (proto, ports, arg_run) in extract_directives(&processed) {
            validate_ports(&ports).map_err(|message| ZapretError::StrategyParse {
                file: path.to_path_buf(),
                line: line_num,
                message,
            })?;

            let args: Vec<String> = split_args(&arg_run)
                .into_iter()
                .map(|a| a.replace("=^!", "=!"))
                .collect();

            strategy.rules.push(FilterRule {
                protocol: proto,
                ports,
                queue_num,
                bypass_on_stall: true,
            });
            strategy.workers.push(WorkerSpec { queue_num, args });
            queue_num += 1;
        }
    }

    if strategy.is_empty() {
        warn!(file = %path.display(), "strategy file contains no filter directives");
    } else {
        debug!(
            file = %path.display(),
            rules = strategy.rules.len(),
            "strategy parsed"
        );
    }

    Ok(strategy)
}

/// Lines skipped before substitution: empty, batch comments (`::`, `rem`),
/// and batch preamble (`@echo`, `chcp`).
fn is_ignored(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty()
        || trimmed.starts_with("::")
        || trimmed.starts_with("rem")
        || trimmed.starts_with("@echo")
        || trimmed.starts_with("chcp")
}

/// Apply the three placeholder substitutions.
///
/// With the game filter disabled, `%GameFilter%` is elided together with one
/// adjacent comma so the surrounding port list stays well-formed.
pub fn apply_placeholders(line: &str, gamefilter: bool) -> String {
    let mut line = line
        .replace(BIN_PLACEHOLDER, "bin/")
        .replace(LISTS_PLACEHOLDER, "lists/");

    if gamefilter {
        line = line.replace(GAME_FILTER_PLACEHOLDER, GAME_FILTER_PORTS);
    } else {
        line = line
            .replace(&format!(",{GAME_FILTER_PLACEHOLDER}"), "")
            .replace(&format!("{GAME_FILTER_PLACEHOLDER},"), "")
            .replace(GAME_FILTER_PLACEHOLDER, "");
    }

    line
}

/// Extract every directive on a line.
///
/// Each `--filter-(tcp|udp)=<ports>` occurrence opens a directive whose
/// argument run extends to the literal `--new`, the next directive, or
/// end-of-line.
fn extract_directives(line: &str) -> Vec<(Protocol, String, String)> {
    let re = directive_regex();
    let matches: Vec<_> = re.captures_iter(line).collect();

    let mut directives = Vec::with_capacity(matches.len());
    for (i, caps) in matches.iter().enumerate() {
        let proto = match &caps[1] {
            "tcp" => Protocol::Tcp,
            _ => Protocol::Udp,
        };
        let ports = caps[2].to_string();

        let run_start = caps.get(0).map(|m| m.end()).unwrap_or(line.len());
        let run_end = matches
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(line.len());

        let mut arg_run = &line[run_start..run_end];
        if let Some(pos) = arg_run.find("--new") {
            arg_run = &arg_run[..pos];
        }

        directives.push((proto, ports, arg_run.trim().to_string()));
    }

    directives
}

/// Split an argument run on whitespace, honoring double-quoted spans.
/// Quotes group; they are not kept in the output tokens.
pub fn split_args(args: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in args.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    result.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        result.push(current);
    }

    result
}

/// Validate a port set expression: comma-separated u16 singletons and
/// inclusive `lo-hi` ranges. A degenerate `n-n` range is legal.
fn validate_ports(ports: &str) -> std::result::Result<(), String> {
    for element in ports.split(',') {
        if element.is_empty() {
            return Err(format!("empty element in port list: {ports:?}"));
        }
        match element.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo
                    .parse()
                    .map_err(|_| format!("invalid port range start: {element:?}"))?;
                let hi: u16 = hi
                    .parse()
                    .map_err(|_| format!("invalid port range end: {element:?}"))?;
                if lo > hi {
                    return Err(format!("port range start exceeds end: {element:?}"));
                }
            }
            None => {
                element
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port: {element:?}"))?;
            }
        }
    }
    Ok(())
}

/// List `.bat` strategy files in the given directories, for the external
/// strategy chooser. Missing directories are skipped.
pub fn find_strategy_files(dirs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for dir in dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ZapretError::from_io(&dir.display().to_string(), e).into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "bat") {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
