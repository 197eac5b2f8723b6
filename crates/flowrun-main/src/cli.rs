use error_stack::ResultExt as _;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use flowrun_core::{FlowVersion, Step, StepId, ValueRef, validate_version};

use crate::logging::LogLevel;
use crate::{
    MainError, Result, engine::Engine, flowrun_config::load_config, run::run_flow, serve::serve,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

/// Flowrun command line application.
///
/// Runs a flow file locally, validates one, or serves a resident engine.
#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log level for flowrun crates.
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log level for other crates.
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Warn)]
    pub other_log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long, global = true, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Execute a flow once against an in-process engine.
    Run {
        /// Path to the flow file to execute.
        #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        flow: PathBuf,

        /// The path to the flowrun config file.
        ///
        /// If not specified, will look for `flowrun-config.yml` in the
        /// directory containing `flow`, then in the current directory.
        #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        config: Option<PathBuf>,

        /// The path to the trigger payload file (JSON or YAML).
        ///
        /// If not set, a null payload is used.
        #[arg(long = "trigger", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        trigger_path: Option<PathBuf>,

        /// Path to write the run report to.
        ///
        /// If not set, will write to stdout.
        #[arg(long = "output", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        output_path: Option<PathBuf>,
    },
    /// Validate a flow file's step graph without executing it.
    Validate {
        /// Path to the flow file to validate.
        #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        flow: PathBuf,
    },
    /// Run a resident engine until interrupted.
    Serve {
        /// Flow files to register on startup.
        #[arg(long = "flow", value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        flows: Vec<PathBuf>,

        /// The path to the flowrun config file.
        #[arg(long, value_name = "FILE", value_hint = clap::ValueHint::FilePath)]
        config: Option<PathBuf>,
    },
}

/// A flow file as authored: a list of steps plus optional identity
/// fields. Ad-hoc files need only `steps`; the entry defaults to the
/// first trigger step.
#[derive(Debug, Deserialize)]
pub struct FlowDoc {
    #[serde(default = "Uuid::now_v7")]
    pub flow_id: Uuid,
    #[serde(default = "default_doc_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub entry: Option<StepId>,
    pub steps: Vec<Step>,
}

fn default_doc_version() -> u32 {
    1
}

impl FlowDoc {
    pub fn into_version(self) -> Result<FlowVersion> {
        let entry = match self.entry {
            Some(entry) => entry,
            None => self
                .steps
                .iter()
                .find(|s| s.kind.is_trigger())
                .map(|s| s.id.clone())
                .ok_or(MainError::InvalidFlow)?,
        };
        let steps: IndexMap<StepId, Step> = self
            .steps
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        Ok(FlowVersion {
            flow_id: self.flow_id,
            version: self.version,
            name: self.name,
            entry,
            steps,
        })
    }
}

enum Format {
    Yaml,
    Json,
}

impl Format {
    fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .unwrap_or_default()
            .to_str()
            .unwrap_or_default();
        match extension {
            "yml" | "yaml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(MainError::UnrecognizedFileExtension(path.to_owned()).into()),
        }
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let rdr = File::open(path).change_context_lazy(|| MainError::MissingFile(path.to_owned()))?;
    let value = match Format::from_path(path)? {
        Format::Json => serde_json::from_reader(rdr)
            .change_context_lazy(|| MainError::InvalidFile(path.to_owned()))?,
        Format::Yaml => serde_yml::from_reader(rdr)
            .change_context_lazy(|| MainError::InvalidFile(path.to_owned()))?,
    };
    Ok(value)
}

fn load_flow(path: &Path) -> Result<FlowVersion> {
    let doc: FlowDoc = load(path)?;
    doc.into_version()
}

fn load_trigger(path: Option<PathBuf>) -> Result<ValueRef> {
    match path {
        Some(path) => load(&path),
        None => Ok(ValueRef::null()),
    }
}

fn write_report(path: Option<PathBuf>, report: &crate::run::RunReport) -> Result<()> {
    match path {
        Some(path) => {
            let format = Format::from_path(&path)?;
            let wtr = File::create(&path)
                .change_context_lazy(|| MainError::CreateOutput(path.clone()))?;
            match format {
                Format::Json => serde_json::to_writer_pretty(wtr, report)
                    .change_context(MainError::WriteOutput)?,
                Format::Yaml => {
                    serde_yml::to_writer(wtr, report).change_context(MainError::WriteOutput)?
                }
            };
            Ok(())
        }
        None => {
            serde_json::to_writer_pretty(std::io::stdout(), report)
                .change_context(MainError::WriteOutput)?;
            println!();
            Ok(())
        }
    }
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        tracing::debug!("Executing command: {:?}", self);
        match self.command {
            Command::Run {
                flow,
                config,
                trigger_path,
                output_path,
            } => {
                let config = load_config(Some(&flow), config)?;
                let version = load_flow(&flow)?;
                validate_version(&version).change_context(MainError::InvalidFlow)?;
                let trigger = load_trigger(trigger_path)?;

                let engine = Engine::build(&config)?;
                let report = run_flow(&engine, version, trigger).await?;
                write_report(output_path, &report)?;
            }
            Command::Validate { flow } => {
                let version = load_flow(&flow)?;
                validate_version(&version).change_context(MainError::InvalidFlow)?;
                println!("{}: ok", flow.display());
            }
            Command::Serve { flows, config } => {
                let config = load_config(None, config)?;
                let mut versions = Vec::with_capacity(flows.len());
                for path in &flows {
                    let version = load_flow(path)?;
                    validate_version(&version).change_context(MainError::InvalidFlow)?;
                    versions.push(version);
                }
                serve(&config, versions).await?;
            }
        };

        Ok(())
    }
}
