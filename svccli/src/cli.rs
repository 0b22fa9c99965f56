use std::collections::{BTreeMap, HashMap};
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde_json::Value;

use crate::binder::{RawInputs, RawValue};
use crate::cancel::StopSignal;
use crate::gate::{ConfirmationGate, TerminalPrompter};
use crate::logging::{self, LogLevel};
use crate::model::{Impact, OperationDescriptor, ParameterDescriptor, ServiceModel, ValueKind};
use crate::output::{render, render_dry_run, OutputFormat};
use crate::transport::{ClientConfig, HttpTransport};
use crate::{exit_code, Engine, Error, InvocationOptions, Outcome};

/// Identity of the binary embedding the dispatcher.
#[derive(Debug, Clone)]
pub struct CliInfo {
    pub name: &'static str,
    pub version: &'static str,
    /// Prefix of the environment variables backing global options, e.g.
    /// `FINPCS` for `FINPCS_ENDPOINT_URL`.
    pub env_prefix: &'static str,
}

impl CliInfo {
    #[must_use]
    pub fn user_agent(&self) -> String {
        format!("{}/{}", self.name, self.version)
    }
}

/// Leaf flags every operation gets. Parameter aliases must not shadow them.
const LEAF_FLAGS: [&str; 6] = [
    "force",
    "select",
    "pass-thru",
    "no-auto-iteration",
    "dry-run",
    "input-file",
];

/// Global options that take a value, for [`normalize_invocation`].
const VALUE_GLOBALS: [&str; 11] = [
    "--region",
    "--endpoint-url",
    "--header",
    "-H",
    "--log-level",
    "--log-file",
    "--conn-timeout",
    "--timeout",
    "-t",
    "--confirm-impact",
    "--model-file",
];

const GLOBAL_NAMES: [&str; 14] = [
    "region",
    "endpoint-url",
    "header",
    "json-output",
    "quiet",
    "verbose",
    "log-level",
    "log-file",
    "json-logs",
    "conn-timeout",
    "timeout",
    "confirm-impact",
    "model-file",
    "help",
];

/// Maps `(verb, noun)`, both lowercased, to the operation behind it.
#[derive(Default)]
pub struct CommandIndex {
    leaves: HashMap<(String, String), (Arc<ServiceModel>, String)>,
}

impl CommandIndex {
    #[must_use]
    pub fn get(&self, verb: &str, noun: &str) -> Option<(&Arc<ServiceModel>, &OperationDescriptor)> {
        let (model, op_name) = self
            .leaves
            .get(&(verb.to_ascii_lowercase(), noun.to_ascii_lowercase()))?;
        let op = model.operation(op_name).ok()?;
        Some((model, op))
    }

    pub fn verbs(&self) -> impl Iterator<Item = &str> {
        self.leaves.keys().map(|(v, _)| v.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// Clap needs `'static` names; the command tree is built once per process
/// from runtime model data, so the strings are leaked.
fn leak_str<S: Into<String>>(s: S) -> &'static str {
    Box::leak(s.into().into_boxed_str())
}

/// Build `<bin> <verb> <Noun> [--Param value ...]` from the loaded models.
pub fn build_cli(models: &[Arc<ServiceModel>], info: &CliInfo) -> (Command, CommandIndex) {
    let mut index = CommandIndex::default();
    // verb (lowercase) -> (display verb, nouns)
    let mut verbs: BTreeMap<String, (String, Vec<Command>)> = BTreeMap::new();

    for model in models {
        for op in &model.operations {
            let key = (op.verb.to_ascii_lowercase(), op.noun.to_ascii_lowercase());
            if let Some((other, other_op)) = index.leaves.get(&key) {
                tracing::warn!(
                    command = %op.command_name(),
                    service = %model.id,
                    shadowed_by = %format!("{}:{other_op}", other.id),
                    "duplicate command ignored"
                );
                continue;
            }
            index
                .leaves
                .insert(key, (Arc::clone(model), op.name.clone()));
            let entry = verbs
                .entry(op.verb.to_ascii_lowercase())
                .or_insert_with(|| (op.verb.clone(), Vec::new()));
            entry.1.push(operation_command(model, op));
        }
    }

    let mut app = Command::new(info.name)
        .version(info.version)
        .about("Run control-plane operations described by service models")
        .arg_required_else_help(true);
    app = add_global_args(app, info);

    for (name, (display, nouns)) in verbs {
        let mut verb_cmd = Command::new(leak_str(name.clone()))
            .about(format!("{display} operations"))
            .arg_required_else_help(true);
        if display != name {
            verb_cmd = verb_cmd.visible_alias(leak_str(display));
        }
        for noun in nouns {
            verb_cmd = verb_cmd.subcommand(noun);
        }
        app = app.subcommand(verb_cmd);
    }
    (app, index)
}

fn add_global_args(app: Command, info: &CliInfo) -> Command {
    let env_name = |suffix: &str| leak_str(format!("{}_{suffix}", info.env_prefix));
    app.arg(
        Arg::new("region")
            .long("region")
            .help("Service region")
            .env("AWS_REGION")
            .default_value("us-east-1")
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("endpoint-url")
            .long("endpoint-url")
            .help("Send requests here instead of the model's regional endpoint")
            .env(env_name("ENDPOINT_URL"))
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("header")
            .long("header")
            .short('H')
            .help("Extra header 'Key: Value' (repeatable)")
            .global(true)
            .num_args(1)
            .action(ArgAction::Append),
    )
    .arg(
        Arg::new("json-output")
            .long("json-output")
            .short('j')
            .help("Output in JSON format")
            .global(true)
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("quiet")
            .long("quiet")
            .short('q')
            .help("Print nothing on success")
            .global(true)
            .conflicts_with("json-output")
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("verbose")
            .long("verbose")
            .short('v')
            .help("Verbose output (debug logging)")
            .global(true)
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("log-level")
            .long("log-level")
            .help("Log level for stderr")
            .value_parser(LogLevel::NAMES)
            .env(env_name("LOG_LEVEL"))
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("log-file")
            .long("log-file")
            .help("Also write debug logs to this file as JSON lines")
            .value_parser(clap::value_parser!(PathBuf))
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("json-logs")
            .long("json-logs")
            .help("Log to stderr as JSON")
            .global(true)
            .action(ArgAction::SetTrue),
    )
    .arg(
        Arg::new("conn-timeout")
            .long("conn-timeout")
            .help("Connection timeout in seconds")
            .default_value("30")
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("timeout")
            .long("timeout")
            .short('t')
            .help("Request timeout in seconds (after connection)")
            .default_value("300")
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("confirm-impact")
            .long("confirm-impact")
            .help("Confirm mutating operations at or above this impact")
            .value_parser(["none", "low", "medium", "high"])
            .ignore_case(true)
            .default_value("medium")
            .env(env_name("CONFIRM_IMPACT"))
            .global(true)
            .num_args(1),
    )
    .arg(
        Arg::new("model-file")
            .long("model-file")
            .help("Load an additional service model (YAML or JSON)")
            .global(true)
            .num_args(1)
            .action(ArgAction::Append),
    )
}

fn operation_command(model: &ServiceModel, op: &OperationDescriptor) -> Command {
    let about = op
        .about
        .clone()
        .unwrap_or_else(|| format!("{} ({})", op.name, model.title.as_deref().unwrap_or(&model.id)));
    let mut cmd = Command::new(leak_str(op.noun.clone())).about(about);
    let lower = op.noun.to_ascii_lowercase();
    if lower != op.noun {
        cmd = cmd.alias(leak_str(lower));
    }

    for p in op.parameters() {
        cmd = cmd.arg(parameter_arg(p));
    }

    cmd = cmd
        .arg(
            Arg::new("force")
                .long("force")
                .help("Do not ask for confirmation")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("select")
                .long("select")
                .help("What to output: '*' for the whole response, '^Param' to echo a parameter, or a response field path")
                .num_args(1),
        )
        .arg(
            Arg::new("dry-run")
                .long("dry-run")
                .alias("what-if")
                .help("Show the request without sending it")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("input-file")
                .long("input-file")
                .help("Read parameters from a YAML/JSON file ('-' for stdin); flags take precedence")
                .num_args(1),
        );
    if let Some(param) = &op.pass_thru {
        cmd = cmd.arg(
            Arg::new("pass-thru")
                .long("pass-thru")
                .help(format!("Output the value of {param} (same as --select ^{param})"))
                .conflicts_with("select")
                .action(ArgAction::SetTrue),
        );
    }
    if op.pagination.is_some() {
        cmd = cmd.arg(
            Arg::new("no-auto-iteration")
                .long("no-auto-iteration")
                .help("Return only the first page of results")
                .action(ArgAction::SetTrue),
        );
    }
    cmd
}

fn parameter_arg(p: &ParameterDescriptor) -> Arg {
    let id = leak_str(p.name.clone());
    let mut help = p.help.clone().unwrap_or_default();
    if !help.is_empty() {
        help.push(' ');
    }
    help.push_str(&format!("[{}]", p.kind.type_label()));
    if p.required {
        help.push_str(" (required)");
    }

    let mut arg = Arg::new(id).long(id).help(help);
    for alias in &p.aliases {
        arg = arg.visible_alias(leak_str(alias.clone()));
    }
    // Parameter names are matched case-insensitively elsewhere; accept the
    // all-lowercase spelling on the command line too.
    let mut hidden: Vec<String> = std::iter::once(&p.name)
        .chain(&p.aliases)
        .map(|n| n.to_ascii_lowercase())
        .filter(|n| n != &p.name && !p.aliases.contains(n))
        .filter(|n| !LEAF_FLAGS.contains(&n.as_str()) && !GLOBAL_NAMES.contains(&n.as_str()))
        .collect();
    hidden.dedup();
    for n in hidden {
        arg = arg.alias(leak_str(n));
    }

    match &p.kind {
        ValueKind::Boolean => arg
            .num_args(0..=1)
            .default_missing_value("true")
            .value_name("BOOL"),
        kind if kind.is_collection() => arg
            .num_args(1)
            .action(ArgAction::Append)
            .value_name(leak_str(kind.type_label().to_ascii_uppercase())),
        kind => arg
            .num_args(1)
            .value_name(leak_str(kind.type_label().to_ascii_uppercase())),
    }
}

pub fn collect_subcommand_path(matches: &ArgMatches) -> (Vec<String>, &ArgMatches) {
    let mut path: Vec<String> = Vec::new();
    let mut current = matches;
    while let Some((name, sub_m)) = current.subcommand() {
        path.push(name.to_string());
        current = sub_m;
    }
    (path, current)
}

pub fn pre_scan_value(args: &[String], key: &str) -> Option<String> {
    pre_scan_values(args, key).into_iter().next()
}

/// Every value of a repeatable option, read before the command tree exists.
pub fn pre_scan_values(args: &[String], key: &str) -> Vec<String> {
    let mut out = Vec::new();
    let prefix = format!("{key}=");
    let mut i = 0;
    while i < args.len() {
        if args[i] == key && i + 1 < args.len() {
            out.push(args[i + 1].clone());
            i += 2;
            continue;
        }
        if let Some(rest) = args[i].strip_prefix(&prefix) {
            out.push(rest.to_string());
        }
        i += 1;
    }
    out
}

/// Accept `Verb-Noun` as one token: `finpcs Get-PCSCluster ...` becomes
/// `finpcs Get PCSCluster ...`. Only the first positional token is
/// considered, and only when its verb part is known.
#[must_use]
pub fn normalize_invocation(args: Vec<String>, index: &CommandIndex) -> Vec<String> {
    let mut i = 1;
    while i < args.len() {
        let a = &args[i];
        if a == "--" {
            return args;
        }
        if a.starts_with('-') {
            if VALUE_GLOBALS.contains(&a.as_str()) {
                i += 1;
            }
            i += 1;
            continue;
        }
        let Some((verb, noun)) = a.split_once('-') else {
            return args;
        };
        if noun.is_empty() || !index.verbs().any(|v| v.eq_ignore_ascii_case(verb)) {
            return args;
        }
        let (verb, noun) = (verb.to_string(), noun.to_string());
        let mut out = args;
        out.splice(i..=i, [verb, noun]);
        return out;
    }
    args
}

/// Raw inputs for `op` from the leaf matches and an optional input file.
/// Command-line values win over the file.
pub fn collect_inputs(op: &OperationDescriptor, leaf: &ArgMatches) -> anyhow::Result<RawInputs> {
    let mut inputs = RawInputs::new();
    for p in op.parameters() {
        if p.kind.is_collection() {
            if let Some(values) = leaf.get_many::<String>(&p.name) {
                inputs.push(p.name.clone(), RawValue::List(values.cloned().collect()));
            }
        } else if let Some(value) = leaf.get_one::<String>(&p.name) {
            inputs.push(p.name.clone(), RawValue::Text(value.clone()));
        }
    }

    if let Some(path) = leaf.get_one::<String>("input-file") {
        let text = if path == "-" {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read input from stdin")?;
            buf
        } else {
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file: {path}"))?
        };
        let doc: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse input file: {path}"))?;
        let from_file = RawInputs::from_document(&doc)?;
        inputs.merge_under(from_file, op);
    }
    Ok(inputs)
}

fn flag(m: &ArgMatches, id: &str) -> bool {
    m.try_get_one::<bool>(id).ok().flatten().copied().unwrap_or(false)
}

#[must_use]
pub fn invocation_options(leaf: &ArgMatches) -> InvocationOptions {
    InvocationOptions {
        force: flag(leaf, "force"),
        select: leaf.try_get_one::<String>("select").ok().flatten().cloned(),
        pass_thru: flag(leaf, "pass-thru"),
        auto_iterate: !flag(leaf, "no-auto-iteration"),
        dry_run: flag(leaf, "dry-run"),
    }
}

fn parse_timeout(matches: &ArgMatches, arg_name: &str) -> Option<f64> {
    matches
        .get_one::<String>(arg_name)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| *v > 0.0)
}

/// Global options after parsing.
#[derive(Debug, Clone)]
pub struct GlobalOptions {
    pub region: String,
    pub endpoint_url: Option<String>,
    pub headers: Vec<String>,
    pub output: OutputFormat,
    pub log_level: LogLevel,
    pub json_logs: bool,
    pub log_file: Option<PathBuf>,
    pub conn_timeout_secs: Option<f64>,
    pub request_timeout_secs: Option<f64>,
    pub confirm_impact: Impact,
}

impl GlobalOptions {
    pub fn from_matches(matches: &ArgMatches) -> anyhow::Result<Self> {
        let output = if matches.get_flag("json-output") {
            OutputFormat::Json
        } else if matches.get_flag("quiet") {
            OutputFormat::Quiet
        } else {
            OutputFormat::Human
        };
        let explicit_level = matches
            .get_one::<String>("log-level")
            .map(|s| s.parse::<LogLevel>())
            .transpose()
            .map_err(anyhow::Error::msg)?;
        let confirm_impact = matches
            .get_one::<String>("confirm-impact")
            .map_or(Ok(Impact::Medium), |s| s.parse::<Impact>())
            .map_err(anyhow::Error::msg)?;
        Ok(Self {
            region: matches
                .get_one::<String>("region")
                .cloned()
                .unwrap_or_else(|| "us-east-1".to_string()),
            endpoint_url: matches.get_one::<String>("endpoint-url").cloned(),
            headers: matches
                .get_many::<String>("header")
                .map(|v| v.cloned().collect())
                .unwrap_or_default(),
            output,
            log_level: logging::resolve_level(explicit_level, matches.get_flag("verbose")),
            json_logs: matches.get_flag("json-logs"),
            log_file: matches.get_one::<PathBuf>("log-file").cloned(),
            conn_timeout_secs: parse_timeout(matches, "conn-timeout"),
            request_timeout_secs: parse_timeout(matches, "timeout"),
            confirm_impact,
        })
    }

    #[must_use]
    pub fn client_config(&self, user_agent: &str) -> ClientConfig {
        ClientConfig {
            region: self.region.clone(),
            endpoint_url: self.endpoint_url.clone(),
            headers: self.headers.clone(),
            conn_timeout_secs: self.conn_timeout_secs,
            request_timeout_secs: self.request_timeout_secs,
            user_agent: user_agent.to_string(),
        }
    }

    pub fn init_logging(&self) -> anyhow::Result<()> {
        logging::init(
            self.log_level,
            logging::resolve_format(self.json_logs),
            self.log_file.as_deref(),
        )
        .context("Failed to set up logging")
    }
}

/// Run the command selected by `matches` and report its outcome. Returns
/// the process exit code.
pub async fn drive_command(
    app: Command,
    index: &CommandIndex,
    matches: &ArgMatches,
    info: &CliInfo,
    mut stop: StopSignal,
) -> anyhow::Result<i32> {
    let globals = GlobalOptions::from_matches(matches)?;
    let (path, leaf) = collect_subcommand_path(matches);

    let [verb, noun] = path.as_slice() else {
        // Intermediate path: print nested help
        let mut cmd = app;
        for name in &path {
            let next_opt = cmd
                .get_subcommands()
                .find(|c| c.get_name() == name)
                .cloned();
            if let Some(next_cmd) = next_opt {
                cmd = next_cmd;
            } else {
                break;
            }
        }
        let _ = cmd.print_help();
        println!();
        return Ok(0);
    };

    let (model, op) = index
        .get(verb, noun)
        .ok_or_else(|| anyhow::anyhow!("No operation registered for {verb} {noun}"))?;
    tracing::debug!(service = %model.id, operation = %op.name, "dispatching");

    let inputs = match collect_inputs(op, leaf) {
        Ok(inputs) => inputs,
        Err(err) => {
            eprintln!("Error: {err:#}");
            return Ok(crate::EXIT_VALIDATION_ERROR);
        }
    };
    let options = invocation_options(leaf);

    let result = match HttpTransport::new(globals.client_config(&info.user_agent())) {
        Ok(transport) => {
            let gate = ConfirmationGate::new(TerminalPrompter, globals.confirm_impact);
            let engine = Engine::new(Arc::clone(model), transport, gate);
            engine.run(&op.name, &inputs, &options, &mut stop).await
        }
        Err(e) => Err(e),
    };

    let code = exit_code(&result);
    match result {
        Ok(Outcome::Completed(value)) => print_text(&render(&value, globals.output)),
        Ok(Outcome::DryRun(envelope)) => print_text(&render_dry_run(&envelope, globals.output)),
        Ok(Outcome::Aborted) => eprintln!("Operation {} was not confirmed; nothing was sent.", op.command_name()),
        Err(Error::Cancelled) => eprintln!("Operation {} cancelled.", op.command_name()),
        Err(err) => report_error(&err),
    }
    Ok(code)
}

fn print_text(text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        println!("{text}");
    }
}

fn report_error(err: &Error) {
    eprintln!("Error: {err}");
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        tracing::debug!(cause = %cause, "caused by");
        source = cause.source();
    }
}
