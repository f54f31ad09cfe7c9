use std::fs;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use xnat_store::client::XnatHttpClient;
use xnat_store::config::ConfigLoader;
use xnat_store::direct::XnatViaCs;
use xnat_store::domain::{DataRow, DataTree, Frequency, RowAddress};
use xnat_store::error::XnatError;
use xnat_store::output::{
    ChecksumsResult, DefinitionResult, FetchResult, JsonOutput, RowResult, TreeResult,
};
use xnat_store::store::{DataStore, Xnat};

#[derive(Parser)]
#[command(name = "xnat-store")]
#[command(about = "Browse and fetch XNAT data through the dataset/row/entry model")]
#[command(version, author)]
struct Cli {
    /// Path to the JSON config (defaults to ./xnat-store.json)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Run inside the container service, reading rows of this frequency from
    /// the archive mount
    #[arg(long, global = true, value_name = "FREQUENCY")]
    via_cs: Option<Frequency>,

    #[arg(long, global = true, requires = "via_cs")]
    mount_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List the (subject, session) leaves of a project")]
    Tree { project: String },
    #[command(about = "List the entries of a row")]
    Row(RowArgs),
    #[command(about = "Show server checksums of a resource")]
    Checksums { uri: String },
    #[command(about = "Download a file-set entry into the cache")]
    Fetch(FetchArgs),
    #[command(about = "Read or write a dataset definition")]
    Definition(DefinitionArgs),
    #[command(about = "Create a project with one MR session per leaf")]
    CreateTree(CreateTreeArgs),
    #[command(about = "Print the config with credentials replaced by an access token")]
    Token,
}

#[derive(Args, Clone)]
struct RowArgs {
    project: String,

    #[arg(long, default_value = "session")]
    frequency: Frequency,

    /// Row id; comma separated for composite ids
    #[arg(long)]
    id: Option<String>,

    /// Subject of a session row
    #[arg(long)]
    subject: Option<String>,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    row: RowArgs,

    /// Entry path within the row, e.g. `T1w/DICOM` or `brain_mask@`
    #[arg(long)]
    path: String,
}

#[derive(Args)]
struct DefinitionArgs {
    #[command(subcommand)]
    command: DefinitionCommand,
}

#[derive(Subcommand)]
enum DefinitionCommand {
    Get { project: String, name: String },
    Put {
        project: String,
        name: String,
        file: String,
    },
}

#[derive(Args)]
struct CreateTreeArgs {
    project: String,

    /// `SUBJECT:SESSION`, repeatable
    #[arg(long = "leaf", required = true)]
    leaves: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<XnatError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &XnatError) -> u8 {
    match error {
        XnatError::NotFound(_) | XnatError::MissingConfig | XnatError::MissingEnv(_) => 2,
        XnatError::XnatHttp(_)
        | XnatError::XnatStatus { .. }
        | XnatError::XnatResponse(_)
        | XnatError::Transfer { .. }
        | XnatError::MissingFilesDir(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(frequency) = cli.via_cs.clone() {
        let store = XnatViaCs::from_env(frequency, cli.mount_id.clone())?;
        return match cli.command {
            Commands::CreateTree(_) | Commands::Token => Err(miette::Report::msg(
                "create-tree and token are not available inside the container service",
            )),
            command => run_store_command(command, &store),
        };
    }

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = Xnat::from_config(config)?;
    match cli.command {
        Commands::CreateTree(args) => run_create_tree(args, &store),
        Commands::Token => {
            let config = store.serialize_config()?;
            JsonOutput::print_config(&config).into_diagnostic()
        }
        command => run_store_command(command, &store),
    }
}

fn run_store_command(command: Commands, store: &dyn DataStore) -> miette::Result<()> {
    match command {
        Commands::Tree { project } => {
            let mut tree = DataTree::new(project);
            store.populate_tree(&mut tree)?;
            JsonOutput::print_tree(&TreeResult::from(&tree)).into_diagnostic()
        }
        Commands::Row(args) => {
            let row = load_row(store, &args)?;
            JsonOutput::print_row(&RowResult::from(&row)).into_diagnostic()
        }
        Commands::Checksums { uri } => {
            let checksums = store.get_checksums(Some(&uri))?;
            JsonOutput::print_checksums(&ChecksumsResult { uri, checksums }).into_diagnostic()
        }
        Commands::Fetch(args) => {
            let row = load_row(store, &args.row)?;
            let entry = row.entry(&args.path).ok_or_else(|| {
                XnatError::NotFound(format!("entry {} in {}", args.path, row.address()))
            })?;
            let fileset = store.get_fileset(entry)?;
            JsonOutput::print_fetch(&FetchResult::new(entry, fileset)).into_diagnostic()
        }
        Commands::Definition(args) => run_definition(args, store),
        Commands::CreateTree(_) | Commands::Token => {
            Err(miette::Report::msg("command needs a REST API store"))
        }
    }
}

fn run_definition(args: DefinitionArgs, store: &dyn DataStore) -> miette::Result<()> {
    match args.command {
        DefinitionCommand::Get { project, name } => {
            let definition = store.load_dataset_definition(&project, &name)?;
            JsonOutput::print_definition(&DefinitionResult {
                dataset_id: project,
                name,
                definition,
            })
            .into_diagnostic()
        }
        DefinitionCommand::Put {
            project,
            name,
            file,
        } => {
            let content = fs::read_to_string(&file).into_diagnostic()?;
            let definition: Value = serde_json::from_str(&content).into_diagnostic()?;
            store.save_dataset_definition(&project, &definition, &name)?;
            JsonOutput::print_definition(&DefinitionResult {
                dataset_id: project,
                name,
                definition: Some(definition),
            })
            .into_diagnostic()
        }
    }
}

fn run_create_tree(args: CreateTreeArgs, store: &Xnat<XnatHttpClient>) -> miette::Result<()> {
    let leaves = args
        .leaves
        .iter()
        .map(|leaf| {
            leaf.split_once(':')
                .map(|(subject, session)| (subject.to_string(), session.to_string()))
                .ok_or_else(|| XnatError::Usage(format!("leaf '{leaf}' is not SUBJECT:SESSION")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let tree = store.create_data_tree(&args.project, &leaves)?;
    JsonOutput::print_tree(&TreeResult::from(&tree)).into_diagnostic()
}

fn load_row(store: &dyn DataStore, args: &RowArgs) -> miette::Result<DataRow> {
    let address = row_address(args)?;
    let mut row = DataRow::new(address);
    store.populate_row(&mut row)?;
    Ok(row)
}

fn row_address(args: &RowArgs) -> Result<RowAddress, XnatError> {
    let project = args.project.clone();
    let id = || {
        args.id
            .clone()
            .ok_or_else(|| XnatError::Usage(format!("{} rows need --id", args.frequency)))
    };
    Ok(match &args.frequency {
        Frequency::Dataset => RowAddress::dataset(project),
        Frequency::Subject => RowAddress::subject(project, id()?),
        Frequency::Session => {
            RowAddress::session(project, args.subject.clone().unwrap_or_default(), id()?)
        }
        Frequency::Custom(_) => RowAddress::custom(
            project,
            args.frequency.clone(),
            args.id
                .as_deref()
                .map(|ids| ids.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        ),
    })
}
