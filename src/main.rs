/*!
 * ERP Gateway CLI
 *
 * Thin front end over the gateway: every command prints a JSON outcome on
 * stdout and exits 0 on success, 1 on partial batch failure, 2 otherwise.
 */

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use erp_gateway::{
    error::EXIT_FATAL,
    logging, BatchOperation, BatchRequest, ExportFormat, ExportRequest, Gateway, GatewayConfig,
    Outcome, RemoteCall, RpcArgs, SearchQuery,
};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "erp-gateway")]
#[command(version, about = "Multi-instance gateway to ERP JSON-RPC endpoints", long_about = None)]
struct Cli {
    /// Configuration file (TOML); instances may also come from the environment
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Instance to use instead of the configured default
    #[arg(short = 'i', long = "instance", value_name = "NAME", global = true)]
    instance: Option<String>,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Write JSON logs to a file instead of stderr
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List known instances without connecting
    Instances,

    /// Connect to the instance and describe it
    Info,

    /// Cache-aware read: call METHOD on MODEL
    Read {
        model: String,
        method: String,

        /// Arguments as a JSON array or {"args": [...], "kwargs": {...}}
        #[arg(short, long, default_value = "[]")]
        args: String,

        /// Cache TTL override in seconds
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Uncached call that invalidates the model's cached reads
    Write {
        model: String,
        method: String,

        /// Arguments as a JSON array or {"args": [...], "kwargs": {...}}
        #[arg(short, long, default_value = "[]")]
        args: String,
    },

    /// Run a chunked bulk operation
    Batch {
        model: String,

        #[arg(value_enum)]
        operation: BatchKind,

        /// Items as a JSON array, or @FILE to read one
        #[arg(long)]
        items: String,

        /// Field names for `read`
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Values object for `write`, or keyword arguments for `method`
        #[arg(long)]
        values: Option<String>,

        /// Method name for `method`
        #[arg(long)]
        method: Option<String>,

        #[arg(long)]
        chunk_size: Option<usize>,

        /// Worker count (0 = auto)
        #[arg(long)]
        workers: Option<usize>,

        /// Deliver chunk results in submission order
        #[arg(long)]
        ordered: bool,
    },

    /// Read every matching record in pages
    PagedRead {
        model: String,

        /// Search domain as JSON
        #[arg(long, default_value = "[]")]
        domain: String,

        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        #[arg(long, default_value = "500")]
        page_size: usize,

        /// Worker count (0 = auto)
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Export matching records to a CSV or JSON file
    Export {
        model: String,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, value_enum, default_value = "csv")]
        format: FormatArg,

        /// Search domain as JSON
        #[arg(long, default_value = "[]")]
        domain: String,

        /// Fields to export (required for CSV)
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        #[arg(long, default_value = "500")]
        page_size: usize,

        /// Stop after this many records
        #[arg(long)]
        max_records: Option<usize>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Csv,
    Json,
}

impl From<FormatArg> for ExportFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Csv => ExportFormat::Csv,
            FormatArg::Json => ExportFormat::Json,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum BatchKind {
    Read,
    Write,
    Unlink,
    Create,
    Method,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => GatewayConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if cli.verbose {
        config.logging.verbose = true;
    }
    if cli.log_file.is_some() {
        config.logging.file = cli.log_file.clone();
    }
    logging::init_logging(&config.logging)?;

    let gateway = Gateway::from_config(config)?;
    if let Some(ref instance) = cli.instance {
        gateway.switch_instance(instance)?;
    }

    let outcome = execute(&gateway, cli.command).await?;
    print_outcome(&outcome)?;
    Ok(outcome.exit_code())
}

async fn execute(gateway: &Gateway, command: Commands) -> anyhow::Result<Outcome> {
    let outcome = match command {
        Commands::Instances => {
            let current = gateway.current_instance();
            let instances: Vec<Value> = gateway
                .list_instances()
                .into_iter()
                .map(|name| json!({ "current": name == current, "name": name }))
                .collect();
            Outcome::success(Value::Array(instances))
        }
        Commands::Info => match gateway.resolve_instance(None).await {
            Ok(_) => match gateway.instance_info(None).await {
                Ok(info) => Outcome::success(serde_json::to_value(info)?),
                Err(e) => Outcome::from_error(&e),
            },
            Err(e) => Outcome::from_error(&e),
        },
        Commands::Read {
            model,
            method,
            args,
            ttl,
        } => {
            let call = RemoteCall::new(model, method, parse_args(&args)?);
            let ttl = ttl.map(Duration::from_secs);
            Outcome::from_result(gateway.read(None, call, ttl).await)
        }
        Commands::Write {
            model,
            method,
            args,
        } => {
            let call = RemoteCall::new(model, method, parse_args(&args)?);
            Outcome::from_result(gateway.write(None, call).await)
        }
        Commands::Batch {
            model,
            operation,
            items,
            fields,
            values,
            method,
            chunk_size,
            workers,
            ordered,
        } => {
            let items = parse_items(&items)?;
            let values = values.as_deref().map(parse_object).transpose()?;
            let operation = match operation {
                BatchKind::Read => BatchOperation::Read { model, fields },
                BatchKind::Write => BatchOperation::Write {
                    model,
                    values: values.context("--values is required for write")?,
                },
                BatchKind::Unlink => BatchOperation::Unlink { model },
                BatchKind::Create => BatchOperation::Create { model },
                BatchKind::Method => BatchOperation::Method {
                    model,
                    method: method.context("--method is required for method batches")?,
                    kwargs: values.unwrap_or_default(),
                },
            };

            let mut request = BatchRequest::default().cancel(cancel_on_ctrl_c());
            request.chunk_size = chunk_size;
            request.workers = workers;
            if ordered {
                request.ordered = Some(true);
            }

            match gateway
                .run_batch(None, items, operation, request, None)
                .await
            {
                Ok(job) => Outcome::from_batch(job),
                Err(e) => Outcome::from_error(&e),
            }
        }
        Commands::PagedRead {
            model,
            domain,
            fields,
            page_size,
            workers,
        } => {
            let domain: Value = serde_json::from_str(&domain).context("parsing --domain")?;
            let query = SearchQuery::new(domain).fields(fields);
            let mut request = BatchRequest::default().cancel(cancel_on_ctrl_c());
            request.workers = workers;

            match gateway
                .paged_search_read(None, &model, query, page_size, request)
                .await
            {
                Ok(paged) => {
                    let records = Value::Array(paged.records);
                    Outcome::from_batch(paged.job).with_value(records)
                }
                Err(e) => Outcome::from_error(&e),
            }
        }
        Commands::Export {
            model,
            output,
            format,
            domain,
            fields,
            page_size,
            max_records,
        } => {
            let domain: Value = serde_json::from_str(&domain).context("parsing --domain")?;
            let query = SearchQuery::new(domain).fields(fields);
            let mut request = ExportRequest::default()
                .format(format.into())
                .page_size(page_size)
                .batch(BatchRequest::default().cancel(cancel_on_ctrl_c()));
            request.max_records = max_records;

            match gateway
                .export_to_path(None, &model, query, request, &output)
                .await
            {
                Ok(summary) => Outcome::from_batch(summary.job).with_value(json!({
                    "model": summary.model,
                    "format": summary.format,
                    "path": output,
                    "total": summary.total,
                    "exported": summary.exported,
                })),
                Err(e) => Outcome::from_error(&e),
            }
        }
    };
    Ok(outcome)
}

fn print_outcome(outcome: &Outcome) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(())
}

fn parse_args(raw: &str) -> anyhow::Result<RpcArgs> {
    let value: Value = serde_json::from_str(raw).context("parsing --args")?;
    Ok(RpcArgs::from_value(value)?)
}

fn parse_object(raw: &str) -> anyhow::Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("parsing --values")? {
        Value::Object(map) => Ok(map),
        other => bail!("--values must be a JSON object, got {}", other),
    }
}

fn parse_items(raw: &str) -> anyhow::Result<Vec<Value>> {
    let text = match raw.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?,
        None => raw.to_string(),
    };
    match serde_json::from_str(&text).context("parsing --items")? {
        Value::Array(items) => Ok(items),
        other => bail!("--items must be a JSON array, got {}", other),
    }
}

/// Token cancelled on the first Ctrl-C; in-flight chunks still finish
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing in-flight chunks");
            child.cancel();
        }
    });
    token
}
