//! Command-line interface for the MQTT ingestion gateway.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mqttgate_core::settings::DEFAULT_SETTINGS_FILE;
use mqttgate_core::{GatewaySettings, InstanceConfig, Schema};
#[cfg(unix)]
use mqttgate_gateway::ControlClient;
use mqttgate_gateway::{
    message_queue, ControlHandler, ControlRequest, Gateway, IngestPipeline, InstanceRegistry,
};
use mqttgate_storage::{DocumentStore, InstanceConfigStore, SchemaStore};
use serde::Serialize;
use serde_json::Value;

/// MqttGate - route MQTT messages into time-series collections.
#[derive(Parser, Debug)]
#[command(name = "mqttgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Settings file.
    #[arg(short, long, global = true, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway until Ctrl-C.
    Serve,
    /// Manage broker instances.
    Instance {
        #[command(subcommand)]
        cmd: InstanceCommand,
    },
    /// Manage routing schemas.
    Schema {
        #[command(subcommand)]
        cmd: SchemaCommand,
    },
    /// Read stored data.
    Query {
        #[command(subcommand)]
        cmd: QueryCommand,
    },
}

/// Instance subcommands.
#[derive(Subcommand, Debug)]
enum InstanceCommand {
    /// Register a new instance.
    Create {
        name: String,
        /// Broker host name or address.
        #[arg(long)]
        broker: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Topic filter, repeatable.
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// Start the instance whenever the gateway starts.
        #[arg(long)]
        autostart: bool,
    },
    Delete {
        name: String,
    },
    List,
    /// Name and connection state of every instance.
    Status,
    /// Connect a registered instance. Needs a running gateway.
    Start {
        name: String,
    },
    /// Disconnect an instance. Needs a running gateway.
    Stop {
        name: String,
    },
    /// Print the full configuration document.
    Show {
        name: String,
    },
    /// Set a configuration value. The value is read as JSON, or as a plain
    /// string if it is not valid JSON.
    Set {
        name: String,
        path: String,
        value: String,
    },
    Get {
        name: String,
        path: String,
    },
    TopicAdd {
        name: String,
        filter: String,
    },
    TopicRemove {
        name: String,
        filter: String,
    },
    Topics {
        name: String,
    },
    /// Most recently received messages.
    Recent {
        name: String,
    },
    /// Publish through a running instance.
    Publish {
        name: String,
        topic: String,
        payload: String,
    },
}

/// Schema subcommands. Documents are read from `--file` or stdin.
#[derive(Subcommand, Debug)]
enum SchemaCommand {
    Create {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    Get {
        database: String,
    },
    Update {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    Delete {
        database: String,
    },
    List,
}

/// Query subcommands.
#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// Documents in `[start, end)`, optionally summed per period.
    Range {
        database: String,
        collection: String,
        /// RFC 3339 start time.
        #[arg(long)]
        start: DateTime<Utc>,
        /// RFC 3339 end time.
        #[arg(long)]
        end: DateTime<Utc>,
        /// Period in minutes.
        #[arg(long)]
        period: Option<i64>,
    },
    All {
        database: String,
        collection: String,
    },
    Last {
        database: String,
        collection: String,
    },
    /// Sum of the last complete period.
    LastPeriod {
        database: String,
        collection: String,
        /// Period in minutes.
        #[arg(long, default_value_t = 60)]
        period: i64,
    },
    Databases,
    Collections {
        database: String,
    },
    /// Collection metadata, all of it or for one collection.
    Metadata {
        collection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let settings = GatewaySettings::load(&args.config)?;
    init_logging(&settings, args.verbose);

    let (request, output) = match args.command {
        Command::Serve => return run_server(&settings).await,
        Command::Instance { cmd } => instance_request(cmd),
        Command::Schema { cmd } => schema_request(cmd)?,
        Command::Query { cmd } => (query_request(cmd), Output::Json),
    };
    let value = execute(&settings, request).await?;
    print_output(output, &value)
}

fn init_logging(settings: &GatewaySettings, verbose: bool) {
    let default_filter = if verbose { "mqttgate=debug" } else { "mqttgate=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    if settings.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

async fn run_server(settings: &GatewaySettings) -> Result<()> {
    let gateway = Gateway::start(settings).await?;
    for status in gateway.registry().status().await {
        tracing::info!(instance = %status.name, state = %status.state, "Instance loaded");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");
    gateway.shutdown().await;
    Ok(())
}

/// Run one administrative request.
///
/// A running gateway is reached through its control socket so the change
/// applies to it directly. Otherwise the request runs here against the
/// persisted state.
async fn execute(settings: &GatewaySettings, request: ControlRequest) -> Result<Value> {
    if let Some(value) = forward(settings, &request).await? {
        return Ok(value);
    }
    let handler = offline_handler(settings)?;
    Ok(handler.handle(request).await?)
}

/// Send `request` to a running gateway. `None` when none is listening.
#[cfg(unix)]
async fn forward(settings: &GatewaySettings, request: &ControlRequest) -> Result<Option<Value>> {
    let Some(mut client) = ControlClient::connect(&settings.control_socket_path()).await? else {
        return Ok(None);
    };
    tracing::debug!("Forwarding request to the running gateway");
    Ok(Some(client.request(request).await?))
}

#[cfg(not(unix))]
async fn forward(_settings: &GatewaySettings, _request: &ControlRequest) -> Result<Option<Value>> {
    Ok(None)
}

/// Handler over the persisted state without a consumer. Instances are never
/// started from here.
fn offline_handler(settings: &GatewaySettings) -> Result<ControlHandler> {
    let store = InstanceConfigStore::open(settings.config_db_path())?;
    let (queue, _receiver) = message_queue();
    let registry = InstanceRegistry::open(store, queue)?;
    let data_path = settings.data_db_path();
    let pipeline = IngestPipeline::new(
        SchemaStore::open(&data_path)?,
        DocumentStore::open(&data_path)?,
    );
    Ok(ControlHandler::offline(Arc::new(registry), pipeline))
}

/// How a command's result is printed.
enum Output {
    Json,
    Lines,
    Done(String),
}

fn instance_request(cmd: InstanceCommand) -> (ControlRequest, Output) {
    match cmd {
        InstanceCommand::Create {
            name,
            broker,
            port,
            topics,
            autostart,
        } => {
            let config = broker.map(|broker| {
                let mut config = InstanceConfig::new(broker);
                if let Some(port) = port {
                    config = config.with_port(port);
                }
                topics.into_iter().fold(config, InstanceConfig::with_topic)
            });
            let done = Output::Done(format!("Created instance '{}'", name));
            (
                ControlRequest::InstanceCreate {
                    name,
                    config,
                    autostart,
                },
                done,
            )
        }
        InstanceCommand::Delete { name } => {
            let done = Output::Done(format!("Deleted instance '{}'", name));
            (ControlRequest::InstanceDelete { name }, done)
        }
        InstanceCommand::List => (ControlRequest::InstanceList, Output::Lines),
        InstanceCommand::Status => (ControlRequest::InstanceStatus, Output::Json),
        InstanceCommand::Start { name } => {
            let done = Output::Done(format!("Started instance '{}'", name));
            (ControlRequest::InstanceStart { name }, done)
        }
        InstanceCommand::Stop { name } => {
            let done = Output::Done(format!("Stopped instance '{}'", name));
            (ControlRequest::InstanceStop { name }, done)
        }
        InstanceCommand::Show { name } => (ControlRequest::InstanceShow { name }, Output::Json),
        InstanceCommand::Set { name, path, value } => {
            let done = Output::Done(format!("Set '{}' on instance '{}'", path, name));
            let value = parse_value(&value);
            (ControlRequest::ConfigSet { name, path, value }, done)
        }
        InstanceCommand::Get { name, path } => (ControlRequest::ConfigGet { name, path }, Output::Json),
        InstanceCommand::TopicAdd { name, filter } => {
            let done = Output::Done(format!("Added topic '{}'", filter));
            (ControlRequest::TopicAdd { name, filter }, done)
        }
        InstanceCommand::TopicRemove { name, filter } => {
            let done = Output::Done(format!("Removed topic '{}'", filter));
            (ControlRequest::TopicRemove { name, filter }, done)
        }
        InstanceCommand::Topics { name } => (ControlRequest::TopicList { name }, Output::Lines),
        InstanceCommand::Recent { name } => (ControlRequest::RecentMessages { name }, Output::Json),
        InstanceCommand::Publish {
            name,
            topic,
            payload,
        } => (
            ControlRequest::Publish {
                name,
                topic,
                payload,
            },
            Output::Done("Published".to_string()),
        ),
    }
}

fn schema_request(cmd: SchemaCommand) -> Result<(ControlRequest, Output)> {
    Ok(match cmd {
        SchemaCommand::Create { file } => {
            let schema = read_schema(file.as_deref())?;
            let done = Output::Done(format!("Created schema '{}'", schema.database));
            (ControlRequest::SchemaCreate { schema }, done)
        }
        SchemaCommand::Get { database } => (ControlRequest::SchemaGet { database }, Output::Json),
        SchemaCommand::Update { file } => {
            let schema = read_schema(file.as_deref())?;
            let done = Output::Done(format!("Updated schema '{}'", schema.database));
            (ControlRequest::SchemaUpdate { schema }, done)
        }
        SchemaCommand::Delete { database } => {
            let done = Output::Done(format!("Deleted schema '{}'", database));
            (ControlRequest::SchemaDelete { database }, done)
        }
        SchemaCommand::List => (ControlRequest::SchemaList, Output::Json),
    })
}

fn query_request(cmd: QueryCommand) -> ControlRequest {
    match cmd {
        QueryCommand::Range {
            database,
            collection,
            start,
            end,
            period,
        } => ControlRequest::QueryRange {
            database,
            collection,
            start,
            end,
            period,
        },
        QueryCommand::All {
            database,
            collection,
        } => ControlRequest::QueryAll {
            database,
            collection,
        },
        QueryCommand::Last {
            database,
            collection,
        } => ControlRequest::QueryLast {
            database,
            collection,
        },
        QueryCommand::LastPeriod {
            database,
            collection,
            period,
        } => ControlRequest::QueryLastPeriod {
            database,
            collection,
            period,
        },
        QueryCommand::Databases => ControlRequest::Databases,
        QueryCommand::Collections { database } => ControlRequest::Collections { database },
        QueryCommand::Metadata { collection } => ControlRequest::Metadata { collection },
    }
}

fn print_output(output: Output, value: &Value) -> Result<()> {
    match output {
        Output::Json => print_json(value)?,
        Output::Lines => {
            for line in value.as_array().into_iter().flatten() {
                match line.as_str() {
                    Some(s) => println!("{}", s),
                    None => println!("{}", line),
                }
            }
        }
        Output::Done(message) => println!("{}", message),
    }
    Ok(())
}

/// JSON if it parses, otherwise a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn read_schema(file: Option<&Path>) -> Result<Schema> {
    let raw = match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read schema from stdin")?;
            buf
        }
    };
    serde_json::from_str(&raw).context("invalid schema document")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
