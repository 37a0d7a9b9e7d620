use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use clap::{Parser, Subcommand};
use hps_core::run_periods::{RunPeriod, DEFAULT_ENG_RUN_DETECTOR};
use serde_json::{to_writer_pretty, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    connection::{ConnectionParameters, CONNECTION_ENV_VAR},
    context::Request,
    converter::MultipleCollectionsAction,
    data::{ConditionsObjectCollection, FieldValue, FieldValueMap, GenericObject},
    manager::DatabaseConditionsManager,
    models::{
        ConditionsRecord, ConditionsRecordCollection, ConditionsTag, ConditionsTagCollection,
        TableMetaData, CONDITIONS_TAGS_TABLE,
    },
    ConditionsError, ConditionsResult, RunNumber,
};

#[derive(Parser)]
#[command(name = "hps-conditions", version)]
struct Cli {
    /// Connection properties file (or env HPS_CONDITIONS_CONNECTION)
    #[arg(long, env = CONNECTION_ENV_VAR)]
    connection: Option<PathBuf>,

    /// SQLite conditions database, overriding any connection properties
    #[arg(long)]
    database: Option<PathBuf>,

    /// Only use conditions records with this tag
    #[arg(long, global = true)]
    tag: Option<String>,

    /// Detector name (defaults to the run period's detector)
    #[arg(long, global = true)]
    detector: Option<String>,

    /// Increase log verbosity (-v, -vv). RUST_LOG takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the collection for <key>[:<run>[:<tag>]]
    Print {
        request: Request,
        /// Run number, if the request does not name one
        #[arg(long)]
        run: Option<RunNumber>,
        /// Multiple collections action: error, last_updated, last_created, latest_run_start,
        /// combine
        #[arg(long, default_value_t = MultipleCollectionsAction::LastCreated)]
        action: MultipleCollectionsAction,
    },
    /// Print every conditions record valid for a run
    Records {
        #[arg(long)]
        run: RunNumber,
        /// Restrict the output to one key
        #[arg(long)]
        key: Option<String>,
    },
    /// Print the members of a tag, or create it from the records valid for a run
    Tag {
        name: String,
        /// Tag the records chosen for every key at this run
        #[arg(long)]
        run: Option<RunNumber>,
        #[arg(long, default_value_t = MultipleCollectionsAction::LastCreated)]
        action: MultipleCollectionsAction,
    },
    /// Load a JSON array of rows as a new collection and add a record for it
    Load {
        /// Table key
        #[arg(long)]
        key: String,
        #[arg(long)]
        run_start: RunNumber,
        #[arg(long)]
        run_end: RunNumber,
        #[arg(long)]
        notes: Option<String>,
        file: PathBuf,
    },
    /// Create any missing conditions tables
    Init,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // A subscriber may already be installed when the CLI is driven from tests.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_manager(cli: &Cli) -> ConditionsResult<DatabaseConditionsManager> {
    let mut manager = match (&cli.database, &cli.connection) {
        (Some(database), _) => {
            DatabaseConditionsManager::with_parameters(ConnectionParameters::sqlite(database))?
        }
        (None, Some(connection)) => {
            DatabaseConditionsManager::with_parameters(ConnectionParameters::from_file(connection)?)?
        }
        (None, None) => DatabaseConditionsManager::new()?,
    };
    manager.set_tag(cli.tag.as_deref());
    Ok(manager)
}

fn detector_for(cli: &Cli, run: RunNumber) -> String {
    cli.detector.clone().unwrap_or_else(|| {
        RunPeriod::try_from(run)
            .map_or(DEFAULT_ENG_RUN_DETECTOR, |period| period.default_detector())
            .to_string()
    })
}

/// Converts one JSON row to the table's fields, in declaration order.
fn row_values(meta: &TableMetaData, row: &Value) -> ConditionsResult<FieldValueMap> {
    let mut values = FieldValueMap::with_capacity(meta.fields().len());
    for field in meta.fields() {
        let value = match row.get(field.name()) {
            None => return Err(ConditionsError::MissingField(field.name().to_string())),
            Some(Value::Null) => FieldValue::Null,
            Some(Value::Bool(b)) => FieldValue::Integer(i64::from(*b)),
            Some(Value::Number(n)) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => FieldValue::Integer(i),
                (None, Some(f)) => FieldValue::Real(f),
                (None, None) => FieldValue::Text(n.to_string()),
            },
            Some(Value::String(s)) => FieldValue::Text(s.clone()),
            Some(other) => FieldValue::Text(other.to_string()),
        };
        values.insert(field.name(), value.coerce(field)?);
    }
    Ok(values)
}

fn load(
    manager: &mut DatabaseConditionsManager,
    key: &str,
    run_start: RunNumber,
    run_end: RunNumber,
    notes: Option<&str>,
    file: &Path,
) -> Result<ConditionsRecord, Box<dyn std::error::Error>> {
    let meta = manager.find_table_meta(key)?;
    let rows: Vec<Value> = serde_json::from_str(&fs::read_to_string(file)?)?;
    let mut collection = ConditionsObjectCollection::with_table_meta(meta.clone());
    for row in &rows {
        collection.add(GenericObject::new(row_values(&meta, row)?))?;
    }
    let collection_id = manager
        .insert_collection(&mut collection)?
        .ok_or_else(|| ConditionsError::TableNotFound(format!("{key} is not a grouped table")))?;
    let mut record = ConditionsRecord::new(key, meta.table_name(), collection_id, run_start, run_end);
    if let Some(tag) = manager.tag() {
        record = record.with_tag(tag);
    }
    if let Ok(user) = env::var("USER") {
        record = record.with_created_by(&user);
    }
    if let Some(notes) = notes {
        record = record.with_notes(notes);
    }
    let mut records = ConditionsRecordCollection::new();
    records.add(record)?;
    manager.insert_collection(&mut records)?;
    info!("loaded {} rows into collection {collection_id} of {key}", collection.len());
    Ok(records.into_objects().remove(0))
}

fn tag_records(
    manager: &mut DatabaseConditionsManager,
    name: &str,
    action: MultipleCollectionsAction,
) -> ConditionsResult<ConditionsTagCollection> {
    let mut tags = ConditionsTagCollection::new();
    for key in manager.table_registry().keys() {
        let chosen = match manager.resolve_records(&key, action) {
            Ok(chosen) => chosen,
            Err(ConditionsError::NoConditionsRecords { .. }) => continue,
            Err(e) => return Err(e),
        };
        for record in chosen {
            if let Some(id) = record.row_id() {
                tags.add(ConditionsTag::new(id, name))?;
            }
        }
    }
    if !tags.is_empty() {
        manager.insert_collection(&mut tags)?;
    }
    Ok(tags)
}

/// Execute the command-line interface with a custom argv iterator.
pub fn run_with_args<I, T>(args: I) -> Result<(), Box<dyn std::error::Error>>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_logging(cli.verbose);
    let mut manager = open_manager(&cli)?;
    let stdout = std::io::stdout();
    match &cli.command {
        Command::Print {
            request,
            run,
            action,
        } => {
            let run = request
                .run
                .or(*run)
                .ok_or(ConditionsError::NotInitialized)?;
            if let Some(tag) = &request.tag {
                manager.set_tag(Some(tag.as_str()));
            }
            manager.set_detector(&detector_for(&cli, run), run)?;
            let collection = manager.get_raw_collection(&request.key, *action)?;
            to_writer_pretty(stdout, &collection)?;
        }
        Command::Records { run, key } => {
            manager.set_detector(&detector_for(&cli, *run), *run)?;
            let records = match key {
                Some(key) => manager.find_conditions_records(key)?,
                None => manager.get_conditions_records(),
            };
            to_writer_pretty(stdout, &records)?;
        }
        Command::Tag { name, run, action } => match run {
            Some(run) => {
                // Records are chosen from every tag, then grouped under the new one.
                manager.set_tag(None);
                manager.set_detector(&detector_for(&cli, *run), *run)?;
                let tags = tag_records(&mut manager, name, *action)?;
                info!("tagged {} records with {name}", tags.len());
                to_writer_pretty(stdout, &tags)?;
            }
            None => {
                manager.set_tag(Some(name.as_str()));
                let tags =
                    manager.get_cached_conditions::<ConditionsTagCollection>(CONDITIONS_TAGS_TABLE)?;
                to_writer_pretty(stdout, &*tags)?;
            }
        },
        Command::Load {
            key,
            run_start,
            run_end,
            notes,
            file,
        } => {
            let record = load(&mut manager, key, *run_start, *run_end, notes.as_deref(), file)?;
            to_writer_pretty(stdout, &record)?;
        }
        Command::Init => {
            if let Some(database) = cli.database.as_deref().filter(|path| !path.exists()) {
                fs::File::create(database)?;
                info!("created conditions database {}", database.display());
            }
            manager.create_tables()?;
            info!("conditions tables created");
            return Ok(());
        }
    }
    println!();
    Ok(())
}

/// Run the command-line interface with the process arguments.
pub fn cli() -> Result<(), Box<dyn std::error::Error>> {
    run_with_args(env::args_os())
}
